#![cfg(feature = "mock")]

//! Bridge semantics: one flow at a time, rendezvous queues, and the
//! empty-queue taxonomy.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use spdm_onboarding::bridge::{BridgeConfig, FlowKind, FlowResult, RetryPolicy, SpdmBridge};
use spdm_onboarding::engine::mock::{MockDevice, MockEngine};
use spdm_onboarding::engine::{SpdmEngine, RESPONSE_FLAGS_KEY_EX_CAP};
use spdm_onboarding::error::BridgeError;

fn bridge_with(device: MockDevice) -> SpdmBridge {
    let config = BridgeConfig::builder()
        .response_timeout(Duration::from_secs(5))
        .queue_timeout(Duration::from_millis(300))
        .retry(RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(20),
            ..RetryPolicy::default()
        })
        .build()
        .unwrap();

    SpdmBridge::new(
        Arc::new(move || Box::new(MockEngine::new(device.clone())) as Box<dyn SpdmEngine>),
        None,
        None,
        config,
    )
}

/// Answer outbound messages until the flow completes, then return the
/// number of exchanges pumped.
async fn pump_to_completion(bridge: &SpdmBridge) -> usize {
    let mut exchanges = 0;
    loop {
        match bridge.try_next_message().await {
            Ok(Some(message)) => {
                assert!(!message.is_empty());
                bridge.push_response(Bytes::from_static(&[0xEE; 6])).unwrap();
                exchanges += 1;
            }
            Ok(None) => return exchanges,
            Err(BridgeError::Empty) => continue,
            Err(e) => panic!("unexpected bridge error: {e}"),
        }
    }
}

#[tokio::test]
async fn version_check_flow_succeeds() {
    let bridge = bridge_with(MockDevice::default());
    bridge.start(FlowKind::VersionCheck).await.unwrap();

    let exchanges = pump_to_completion(&bridge).await;
    assert_eq!(exchanges, 1);
    assert!(!bridge.is_processing());
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));

    // The result is consumed on read.
    assert_eq!(bridge.take_result(), None);
}

#[tokio::test]
async fn wrong_version_fails_flow() {
    let device = MockDevice {
        version: 0x11,
        ..MockDevice::default()
    };
    let bridge = bridge_with(device);
    bridge.start(FlowKind::VersionCheck).await.unwrap();

    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Failure));
}

#[tokio::test]
async fn missing_key_exchange_capability_is_distinct_result() {
    let device = MockDevice {
        responder_capabilities: 0,
        ..MockDevice::default()
    };
    let bridge = bridge_with(device);
    bridge.start(FlowKind::CapabilityCheck).await.unwrap();

    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::UnsupportedCapability));
}

#[tokio::test]
async fn capability_check_succeeds_with_key_exchange() {
    let device = MockDevice {
        responder_capabilities: RESPONSE_FLAGS_KEY_EX_CAP,
        ..MockDevice::default()
    };
    let bridge = bridge_with(device);
    bridge.start(FlowKind::CapabilityCheck).await.unwrap();

    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}

#[tokio::test]
async fn set_authority_flow_pumps_negotiation_and_install() {
    let bridge = bridge_with(MockDevice::default());
    bridge
        .start(FlowKind::SetAuthority {
            certificate_chain: vec![vec![0x30, 0x82, 0x01, 0x02], vec![0x30, 0x82, 0x03, 0x04]],
            slot_id: 2,
        })
        .await
        .unwrap();

    // Three negotiation exchanges plus the SET_CERTIFICATE exchange.
    let exchanges = pump_to_completion(&bridge).await;
    assert_eq!(exchanges, 4);
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}

#[tokio::test]
async fn set_authority_with_empty_chain_fails() {
    let bridge = bridge_with(MockDevice::default());
    bridge
        .start(FlowKind::SetAuthority {
            certificate_chain: Vec::new(),
            slot_id: 0,
        })
        .await
        .unwrap();

    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Failure));
}

#[tokio::test]
async fn secure_session_probe_runs_full_sequence() {
    let bridge = bridge_with(MockDevice::default());
    bridge
        .start(FlowKind::SecureSessionProbe {
            measurement_slot_id: 0,
            payload: vec![0x01, 0x02, 0x03],
        })
        .await
        .unwrap();

    // VCA (3) + digests + certificate + measurements + key exchange +
    // vendor-defined + end session.
    let exchanges = pump_to_completion(&bridge).await;
    assert_eq!(exchanges, 9);
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}

#[tokio::test]
async fn secure_session_probe_flags_attestation_failure() {
    let device = MockDevice {
        // KEY_EXCHANGE reports a hash that does not match the measurements.
        key_exchange_measurement_hash: Some([0x55; 48]),
        ..MockDevice::default()
    };
    let bridge = bridge_with(device);
    bridge
        .start(FlowKind::SecureSessionProbe {
            measurement_slot_id: 0,
            payload: vec![0x01],
        })
        .await
        .unwrap();

    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::AttestationFailed));
}

#[tokio::test]
async fn starting_second_flow_is_rejected_after_retries() {
    let bridge = bridge_with(MockDevice::default());
    bridge.start(FlowKind::VersionCheck).await.unwrap();

    // The first flow is blocked on a device response, so its result is
    // still unset.
    let message = bridge.next_message().await.unwrap();
    assert!(!message.is_empty());

    assert!(matches!(
        bridge.start(FlowKind::VersionCheck).await,
        Err(BridgeError::AlreadyRunning)
    ));

    bridge.push_response(Bytes::from_static(&[0xEE; 6])).unwrap();
    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}

#[tokio::test]
async fn timeout_before_any_message_is_unrecoverable() {
    // Context preparation fails immediately: the flow dies without ever
    // producing a message.
    let device = MockDevice {
        fail_prepare: true,
        ..MockDevice::default()
    };
    let bridge = bridge_with(device);
    bridge.start(FlowKind::VersionCheck).await.unwrap();

    assert!(matches!(
        bridge.next_message().await,
        Err(BridgeError::UnrecoverableEmpty)
    ));
    assert_eq!(bridge.take_result(), Some(FlowResult::Failure));
}

#[tokio::test]
async fn empty_after_first_message_is_retryable() {
    let bridge = bridge_with(MockDevice::default());
    bridge.start(FlowKind::VersionCheck).await.unwrap();

    // First message arrives; the flow then blocks waiting for a device
    // response, so a second poll finds the queue momentarily empty.
    let first = bridge.next_message().await.unwrap();
    assert!(!first.is_empty());

    assert!(matches!(
        bridge.next_message().await,
        Err(BridgeError::Empty)
    ));
    assert!(bridge.is_processing());

    bridge.push_response(Bytes::from_static(&[0xEE; 6])).unwrap();
    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}

#[tokio::test]
async fn response_after_flow_end_is_rejected() {
    let bridge = bridge_with(MockDevice::default());
    bridge.start(FlowKind::VersionCheck).await.unwrap();
    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));

    assert!(matches!(
        bridge.push_response(Bytes::from_static(&[0x00])),
        Err(BridgeError::ResponseRejected)
    ));
}

#[tokio::test]
async fn bridge_is_reusable_after_flow_completes() {
    let bridge = bridge_with(MockDevice::default());

    bridge.start(FlowKind::VersionCheck).await.unwrap();
    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));

    bridge.start(FlowKind::VersionCheck).await.unwrap();
    pump_to_completion(&bridge).await;
    assert_eq!(bridge.take_result(), Some(FlowResult::Success));
}
