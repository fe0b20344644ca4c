//! Scripted in-memory engine for tests and development.
//!
//! Behaves like the native requester engine from the driver's point of
//! view: every protocol operation performs real send/receive round trips
//! through the registered callback slots, so queue-pumping and callback
//! translation can be exercised without a device or the native library.
//!
//! # Security Warning
//!
//! This engine performs **zero cryptography** and must never be used in
//! production. Enable it only via `features = ["mock"]`.

use std::sync::Arc;

use sha2::{Digest, Sha384};

use crate::driver::callbacks::EngineCallbacks;

use super::{
    DigestsOut, EngineParameter, MeasurementsOut, RawStatus, SessionOut, SpdmEngine,
    MAX_SPDM_BUFFER_SIZE, RESPONSE_FLAGS_KEY_EX_CAP, SHA384_LEN,
};

const MOCK_CONTEXT_SIZE: usize = 256;

/// Scripted responder behavior. Construct with struct-update syntax over
/// [`MockDevice::default`] and tweak only what the test needs.
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Protocol version byte reported after negotiation.
    pub version: u8,
    /// Wire round trips performed by a full connection negotiation.
    pub vca_round_trips: usize,
    /// Populated certificate slots.
    pub slot_mask: u8,
    /// Chain returned by GET_CERTIFICATE.
    pub certificate_chain: Vec<u8>,
    /// Raw measurement record returned by GET_MEASUREMENTS.
    pub measurements: Vec<u8>,
    /// Session identifier granted by KEY_EXCHANGE. Zero simulates a
    /// responder that "succeeds" without opening a session.
    pub session_id: u32,
    /// Measurement hash reported during KEY_EXCHANGE. `None` reports the
    /// SHA-384 of `measurements`, i.e. an honest responder.
    pub key_exchange_measurement_hash: Option<[u8; SHA384_LEN]>,
    /// Response to an in-session vendor-defined request.
    pub session_response: Vec<u8>,
    /// Capability flags the responder advertises.
    pub responder_capabilities: u32,
    /// Fail context preparation.
    pub fail_prepare: bool,
    /// Force this status on every protocol command.
    pub command_status: Option<RawStatus>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            version: 0x12,
            vca_round_trips: 3,
            slot_mask: 0b0000_0001,
            certificate_chain: vec![0x30, 0x82, 0x00, 0x10, 0xAA, 0xBB],
            measurements: vec![0xD1; 64],
            session_id: 0x1122_3344,
            key_exchange_measurement_hash: None,
            session_response: vec![0xC0, 0xDE],
            responder_capabilities: RESPONSE_FLAGS_KEY_EX_CAP,
            fail_prepare: false,
            command_status: None,
        }
    }
}

/// In-memory [`SpdmEngine`] implementation backed by a [`MockDevice`].
pub struct MockEngine {
    device: MockDevice,
    callbacks: Option<Arc<EngineCallbacks>>,
    prepared: bool,
    scratch_size: usize,
}

impl MockEngine {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            callbacks: None,
            prepared: false,
            scratch_size: 0,
        }
    }

    /// One wire exchange: push a synthetic request through the send slot,
    /// then demand a response through the receive slot.
    fn round_trip(&self, operation: &[u8]) -> RawStatus {
        let Some(callbacks) = self.callbacks.as_ref() else {
            return RawStatus::SPDM_INTERNAL_EXCEPTION;
        };

        let mut request = vec![0x10];
        request.extend_from_slice(operation);

        let status = callbacks.device_send(&[0u8; 8], &request);
        if !status.is_success() {
            return status;
        }

        let (status, _response) = callbacks.device_receive();
        status
    }

    fn command(&self, operation: &[u8], round_trips: usize) -> RawStatus {
        for _ in 0..round_trips {
            let status = self.round_trip(operation);
            if !status.is_success() {
                return status;
            }
        }
        self.device.command_status.unwrap_or(RawStatus::SUCCESS)
    }
}

impl SpdmEngine for MockEngine {
    fn context_size(&self) -> usize {
        MOCK_CONTEXT_SIZE
    }

    fn register_callbacks(&mut self, callbacks: Arc<EngineCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn prepare_context(&mut self, _sender_receive_buffer_size: u32) -> RawStatus {
        if self.device.fail_prepare {
            return RawStatus::SPDM_INTERNAL_EXCEPTION;
        }
        self.prepared = true;
        RawStatus::SUCCESS
    }

    fn required_scratch_size(&mut self) -> usize {
        MOCK_CONTEXT_SIZE * 2
    }

    fn set_scratch_buffer(&mut self, size: usize) {
        self.scratch_size = size;
    }

    fn set_parameter(&mut self, _parameter: EngineParameter) -> RawStatus {
        RawStatus::SUCCESS
    }

    fn set_local_certificate_chain(&mut self, _slot_id: u8, _encoded_chain: &[u8]) -> RawStatus {
        RawStatus::SUCCESS
    }

    fn init_connection(&mut self, version_only: bool) -> RawStatus {
        let round_trips = if version_only {
            1
        } else {
            self.device.vca_round_trips
        };
        self.command(b"VCA", round_trips)
    }

    fn negotiated_version(&self) -> u8 {
        self.device.version
    }

    fn capability_supported(&self, responder_flag: u32) -> bool {
        self.device.responder_capabilities & responder_flag == responder_flag
    }

    fn get_digests(&mut self, out: &mut DigestsOut) -> RawStatus {
        let status = self.command(b"GET_DIGESTS", 1);
        if !status.is_success() {
            return status;
        }

        out.slot_mask = self.device.slot_mask;
        out.buffer.clear();
        for slot in 0..u8::BITS as u8 {
            if self.device.slot_mask & (1 << slot) != 0 {
                out.buffer.extend_from_slice(&[slot; SHA384_LEN]);
            }
        }
        RawStatus::SUCCESS
    }

    fn get_certificate(&mut self, _slot_id: u8, out: &mut Vec<u8>) -> RawStatus {
        let status = self.command(b"GET_CERTIFICATE", 1);
        if !status.is_success() {
            return status;
        }

        out.clear();
        let len = self.device.certificate_chain.len().min(MAX_SPDM_BUFFER_SIZE);
        out.extend_from_slice(&self.device.certificate_chain[..len]);
        RawStatus::SUCCESS
    }

    fn get_measurements(
        &mut self,
        _request_attributes: u8,
        _operation: u8,
        _slot_id: u8,
        out: &mut MeasurementsOut,
    ) -> RawStatus {
        let status = self.command(b"GET_MEASUREMENTS", 1);
        if !status.is_success() {
            return status;
        }

        out.number_of_blocks = 1;
        out.record = self.device.measurements.clone();
        RawStatus::SUCCESS
    }

    fn set_certificate(&mut self, _slot_id: u8, _chain_image: &[u8], _chain_len: usize) -> RawStatus {
        self.command(b"SET_CERTIFICATE", 1)
    }

    fn start_session(
        &mut self,
        _measurement_hash_type: u8,
        _slot_id: u8,
        _session_policy: u8,
        out: &mut SessionOut,
    ) -> RawStatus {
        let status = self.command(b"KEY_EXCHANGE", 1);
        if !status.is_success() {
            return status;
        }

        out.session_id = self.device.session_id;
        out.heartbeat_period = 0;
        out.measurement_hash = self.device.key_exchange_measurement_hash.unwrap_or_else(|| {
            let mut hash = [0u8; SHA384_LEN];
            hash.copy_from_slice(&Sha384::digest(&self.device.measurements));
            hash
        });
        RawStatus::SUCCESS
    }

    fn stop_session(&mut self, _session_id: u32, _attributes: u8) -> RawStatus {
        self.command(b"END_SESSION", 1)
    }

    fn send_receive_in_session(
        &mut self,
        _session_id: u32,
        _request: &[u8],
        response: &mut Vec<u8>,
    ) -> RawStatus {
        let status = self.command(b"VENDOR_DEFINED_REQUEST", 1);
        if !status.is_success() {
            return status;
        }

        response.clear();
        response.extend_from_slice(&self.device.session_response);
        RawStatus::SUCCESS
    }

    fn deinit(&mut self) {
        self.prepared = false;
    }
}
