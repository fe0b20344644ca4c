//! Bridge between the synchronous protocol driver and a stateless caller.
//!
//! The driver must run a multi-message protocol sequence to completion, but
//! the caller can only deliver one device response per request. The bridge
//! runs each flow on a dedicated blocking task and rendezvous with the
//! caller through two capacity-one queues: outbound protocol messages the
//! device must answer, and inbound device responses. Exactly one outbound
//! message is outstanding at a time; a pushed response always answers the
//! most recently retrieved message.

pub mod flows;
pub mod retry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::driver::callbacks::{CollaboratorError, MessageTransport, Signer};
use crate::driver::params::SpdmParameters;
use crate::driver::SpdmSession;
use crate::engine::SpdmEngine;
use crate::error::BridgeError;

pub use self::flows::{FlowKind, FlowResult, SUPPORTED_VERSION};
pub use self::retry::RetryPolicy;

/// Creates one engine per flow; each flow drives a fresh native context.
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self) -> Box<dyn SpdmEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn SpdmEngine> + Send + Sync,
{
    fn create_engine(&self) -> Box<dyn SpdmEngine> {
        self()
    }
}

/// Bridge tuning knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long the background task waits for a device response before the
    /// receive callback reports an empty response (default: 30s).
    pub response_timeout: Duration,

    /// How long a caller waits for the next outbound protocol message
    /// (default: 5s).
    pub queue_timeout: Duration,

    /// Retry policy for the busy-bridge check and empty-queue polls.
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Default, Clone)]
pub struct BridgeConfigBuilder {
    response_timeout: Option<Duration>,
    queue_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl BridgeConfigBuilder {
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Build the config, validating that all timeouts are non-zero.
    pub fn build(self) -> Result<BridgeConfig, BridgeError> {
        let defaults = BridgeConfig::default();
        let config = BridgeConfig {
            response_timeout: self.response_timeout.unwrap_or(defaults.response_timeout),
            queue_timeout: self.queue_timeout.unwrap_or(defaults.queue_timeout),
            retry: self.retry.unwrap_or(defaults.retry),
        };
        if config.response_timeout.is_zero() || config.queue_timeout.is_zero() {
            return Err(BridgeError::TerminatedAbnormally(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(config)
    }
}

struct BridgeState {
    running: AtomicBool,
    produced_any: AtomicBool,
    result: Mutex<Option<FlowResult>>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    inbound_tx: Mutex<Option<std::sync::mpsc::SyncSender<Bytes>>>,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            produced_any: AtomicBool::new(false),
            result: Mutex::new(None),
            outbound_rx: tokio::sync::Mutex::new(None),
            inbound_tx: Mutex::new(None),
        }
    }
}

/// Marks the flow finished even if the flow body panics.
struct FlowCompletion {
    state: Arc<BridgeState>,
}

impl Drop for FlowCompletion {
    fn drop(&mut self) {
        let mut result = self.state.result.lock().unwrap_or_else(|e| e.into_inner());
        if result.is_none() {
            *result = Some(FlowResult::Failure);
        }
        self.state.running.store(false, Ordering::Release);
    }
}

/// Queue-backed transport handed to the driver: outbound messages rendezvous
/// with the caller, inbound responses are awaited with a bounded timeout.
struct QueueTransport {
    state: Arc<BridgeState>,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<std::sync::mpsc::Receiver<Bytes>>,
    response_timeout: Duration,
}

impl MessageTransport for QueueTransport {
    fn send_message(&self, _session_context: &[u8], payload: &[u8]) -> Result<(), CollaboratorError> {
        self.outbound_tx
            .blocking_send(Bytes::copy_from_slice(payload))
            .map_err(|_| CollaboratorError::new("outbound queue closed"))?;
        self.state.produced_any.store(true, Ordering::Release);
        Ok(())
    }

    fn receive_response(&self) -> Result<Option<Vec<u8>>, CollaboratorError> {
        let rx = self
            .inbound_rx
            .lock()
            .map_err(|_| CollaboratorError::new("inbound queue poisoned"))?;
        match rx.recv_timeout(self.response_timeout) {
            Ok(response) => Ok(Some(response.to_vec())),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// Runs protocol flows on a background task and exposes them to a
/// one-round-trip-at-a-time caller.
///
/// At most one flow is active at a time; the driver it owns is never
/// touched from request context.
pub struct SpdmBridge {
    engines: Arc<dyn EngineFactory>,
    signer: Option<Arc<dyn Signer>>,
    local_chain: Option<Vec<u8>>,
    config: BridgeConfig,
    state: Arc<BridgeState>,
}

impl SpdmBridge {
    pub fn new(
        engines: Arc<dyn EngineFactory>,
        signer: Option<Arc<dyn Signer>>,
        local_chain: Option<Vec<u8>>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            engines,
            signer,
            local_chain,
            config,
            state: Arc::new(BridgeState::new()),
        }
    }

    /// True while the background task has not reached a terminal state.
    pub fn is_processing(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// True once a terminal result is available.
    pub fn is_result_ready(&self) -> bool {
        self.state
            .result
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Consume the terminal result, if the flow has ended.
    pub fn take_result(&self) -> Option<FlowResult> {
        self.state
            .result
            .lock()
            .ok()
            .and_then(|mut result| result.take())
    }

    /// Verify no flow is active, retrying per the configured policy before
    /// surfacing [`BridgeError::AlreadyRunning`].
    pub async fn ensure_not_running(&self) -> Result<(), BridgeError> {
        let this = self;
        retry::with_retry(&self.config.retry, || async move {
            if this.is_processing() {
                Err(BridgeError::AlreadyRunning)
            } else {
                Ok(())
            }
        })
        .await
    }

    /// Start a flow on the background task.
    ///
    /// Fails with [`BridgeError::AlreadyRunning`] (after the busy check's
    /// retries are exhausted) while a prior flow is still active.
    pub async fn start(&self, kind: FlowKind) -> Result<(), BridgeError> {
        self.ensure_not_running().await?;

        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::AlreadyRunning);
        }

        tracing::debug!(flow = kind.name(), "starting protocol flow");

        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(1);
        let (inbound_tx, inbound_rx) = std::sync::mpsc::sync_channel::<Bytes>(1);

        *self.state.outbound_rx.lock().await = Some(outbound_rx);
        *self
            .state
            .inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(inbound_tx);
        *self.state.result.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.state.produced_any.store(false, Ordering::Release);

        let transport = Arc::new(QueueTransport {
            state: self.state.clone(),
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            response_timeout: self.config.response_timeout,
        });

        let engine = self.engines.create_engine();
        let signer = self.signer.clone();
        let local_chain = self.local_chain.clone();
        let state = self.state.clone();

        let _flow_task = tokio::task::spawn_blocking(move || {
            let completion = FlowCompletion {
                state: state.clone(),
            };

            let mut session = SpdmSession::new(
                engine,
                transport,
                signer,
                SpdmParameters::default(),
                local_chain,
            );

            let result = flows::run(&kind, &mut session);
            session.close();
            tracing::debug!(flow = kind.name(), %result, "protocol flow finished");

            *state.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            drop(completion);
        });

        Ok(())
    }

    /// Inject exactly one device response; it answers the most recently
    /// retrieved outbound message.
    pub fn push_response(&self, response: Bytes) -> Result<(), BridgeError> {
        let guard = self
            .state
            .inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(BridgeError::ResponseRejected);
        };
        tx.try_send(response)
            .map_err(|_| BridgeError::ResponseRejected)
    }

    /// Retrieve the next outbound protocol message, waiting up to the
    /// configured queue timeout.
    ///
    /// Timing out before the flow ever produced a message is fatal
    /// ([`BridgeError::UnrecoverableEmpty`]: the bridge is presumed dead);
    /// timing out while the flow is still running after at least one
    /// message was produced is the retryable [`BridgeError::Empty`].
    pub async fn next_message(&self) -> Result<Bytes, BridgeError> {
        let mut guard = self.state.outbound_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(BridgeError::UnrecoverableEmpty);
        };

        match tokio::time::timeout(self.config.queue_timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) | Err(_) => Err(self.classify_empty()),
        }
    }

    /// Non-blocking variant with a bounded retry while the flow is running.
    ///
    /// `Ok(Some(_))`: a message is available. `Ok(None)`: the flow has
    /// ended and no further messages will come — check the result.
    /// `Err(Empty)`: the flow is still running but produced nothing within
    /// the retry budget.
    pub async fn try_next_message(&self) -> Result<Option<Bytes>, BridgeError> {
        let retry = self.config.retry.clone();
        let this = self;
        retry::with_retry(&retry, || async move {
            let mut guard = this.state.outbound_rx.lock().await;
            let Some(rx) = guard.as_mut() else {
                return Ok(None);
            };

            match rx.try_recv() {
                Ok(message) => Ok(Some(message)),
                Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if this.is_processing() {
                        Err(BridgeError::Empty)
                    } else {
                        Ok(None)
                    }
                }
            }
        })
        .await
    }

    fn classify_empty(&self) -> BridgeError {
        if !self.state.produced_any.load(Ordering::Acquire) {
            return BridgeError::UnrecoverableEmpty;
        }
        if self.is_processing() {
            BridgeError::Empty
        } else {
            BridgeError::UnrecoverableEmpty
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::engine::mock::{MockDevice, MockEngine};

    fn test_bridge(device: MockDevice) -> SpdmBridge {
        let config = BridgeConfig::builder()
            .response_timeout(Duration::from_millis(500))
            .queue_timeout(Duration::from_millis(200))
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

    #[tokio::test]
    async fn next_message_without_flow_is_unrecoverable() {
        let bridge = test_bridge(MockDevice::default());
        assert!(matches!(
            bridge.next_message().await,
            Err(BridgeError::UnrecoverableEmpty)
        ));
    }

    #[tokio::test]
    async fn version_check_pumps_one_exchange() {
        let bridge = test_bridge(MockDevice::default());
        bridge.start(FlowKind::VersionCheck).await.unwrap();

        let message = bridge.next_message().await.unwrap();
        assert!(!message.is_empty());

        bridge.push_response(Bytes::from_static(&[0xAA; 4])).unwrap();

        // Flow completes; no further messages.
        assert_eq!(bridge.try_next_message().await.unwrap(), None);
        assert_eq!(bridge.take_result(), Some(FlowResult::Success));
        assert!(!bridge.is_processing());
    }

    #[tokio::test]
    async fn second_flow_while_running_is_rejected() {
        let bridge = test_bridge(MockDevice::default());
        bridge.start(FlowKind::VersionCheck).await.unwrap();

        // The flow is blocked waiting for a device response.
        bridge.next_message().await.unwrap();

        assert!(matches!(
            bridge.start(FlowKind::VersionCheck).await,
            Err(BridgeError::AlreadyRunning)
        ));

        // Unblock and finish.
        bridge.push_response(Bytes::from_static(&[0xAA; 4])).unwrap();
        assert_eq!(bridge.try_next_message().await.unwrap(), None);
        assert_eq!(bridge.take_result(), Some(FlowResult::Success));
    }
}
