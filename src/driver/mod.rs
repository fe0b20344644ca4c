//! Attestation session driver.
//!
//! Owns one engine context for its whole lifecycle, wires the engine's
//! callback slots to the injected transport and signer, and exposes the
//! protocol operations with pre/post-condition checks. The driver is
//! single-threaded by contract: it must only ever be driven by the bridge
//! task that owns it.

pub mod callbacks;
pub mod framing;
pub mod params;

use std::sync::Arc;

use sha2::{Digest, Sha384};

use crate::engine::{
    DigestsOut, MeasurementsOut, RawStatus, SessionOut, SpdmEngine,
    KEY_EXCHANGE_ALL_MEASUREMENTS_HASH, MEASUREMENTS_OPERATION_ALL,
    MEASUREMENTS_REQUEST_GENERATE_SIGNATURE, SENDER_RECEIVE_BUFFER_SIZE, SHA384_LEN,
};
use crate::error::ProtocolError;

use self::callbacks::{EngineCallbacks, MessageTransport, Signer};
use self::framing::{encode_local_chain, SetCertificateImage};
use self::params::SpdmParameters;

/// Translate a raw engine status into the driver error taxonomy. Raw status
/// words never leak past this point.
pub(crate) fn fail_on_error(status: RawStatus) -> Result<(), ProtocolError> {
    if status == RawStatus::SPDM_NOT_SUPPORTED {
        return Err(ProtocolError::NotSupported);
    }
    if status == RawStatus::SPDM_INTERNAL_EXCEPTION {
        return Err(ProtocolError::InternalException);
    }
    if !status.is_success() {
        return Err(ProtocolError::CommandFailed(status));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Uninitialized,
    ContextReady,
    ConnectionEstablished,
    Closed,
}

/// Parsed GET_DIGESTS result: populated-slot bitmask and one SHA-384 digest
/// per set bit.
#[derive(Debug, Clone)]
pub struct DigestsResponse {
    pub slot_mask: u8,
    pub digests: Vec<[u8; SHA384_LEN]>,
}

/// One attestation session against a device.
///
/// Secure-session establishment does not leave `ConnectionEstablished`
/// behind: stopping the secure session drops back to a plain connection.
pub struct SpdmSession {
    engine: Box<dyn SpdmEngine>,
    callbacks: Arc<EngineCallbacks>,
    parameters: SpdmParameters,
    local_chain: Option<Vec<u8>>,
    state: SessionState,
    secure_session_id: u32,
    expected_measurement_hash: Option<[u8; SHA384_LEN]>,
}

impl SpdmSession {
    pub fn new(
        engine: Box<dyn SpdmEngine>,
        transport: Arc<dyn MessageTransport>,
        signer: Option<Arc<dyn Signer>>,
        parameters: SpdmParameters,
        local_chain: Option<Vec<u8>>,
    ) -> Self {
        Self {
            engine,
            callbacks: Arc::new(EngineCallbacks::new(transport, signer)),
            parameters,
            local_chain,
            state: SessionState::Uninitialized,
            secure_session_id: 0,
            expected_measurement_hash: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::ConnectionEstablished
    }

    pub fn is_secure_session_established(&self) -> bool {
        self.secure_session_id != 0
    }

    /// Allocate the native context, register the callback slots and push
    /// the local operating parameters. Runs at most once per session.
    fn ensure_context(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Closed => return Err(ProtocolError::ConnectionNotEstablished),
            _ => {
                tracing::debug!("protocol context already initialized");
                return Ok(());
            }
        }

        tracing::debug!("initializing protocol context");
        self.engine.register_callbacks(self.callbacks.clone());

        let status = self.engine.prepare_context(SENDER_RECEIVE_BUFFER_SIZE);
        tracing::debug!(status = status.value(), "prepare context");
        if !status.is_success() {
            return Err(ProtocolError::InitFailed);
        }

        let scratch_size = self.engine.required_scratch_size();
        self.engine.set_scratch_buffer(scratch_size);

        self.parameters.apply(self.engine.as_mut())?;

        if let Some(chain) = self.local_chain.as_ref().filter(|c| !c.is_empty()) {
            let encoded = encode_local_chain(chain);
            fail_on_error(self.engine.set_local_certificate_chain(0, &encoded))?;
        } else {
            tracing::debug!("no local certificate chain provided - skipped");
        }

        self.state = SessionState::ContextReady;
        Ok(())
    }

    /// GET_VERSION only: report the responder's protocol version without a
    /// full capability/algorithm negotiation.
    pub fn get_version(&mut self) -> Result<String, ProtocolError> {
        self.ensure_context()?;

        tracing::debug!("sending GET_VERSION");
        fail_on_error(self.engine.init_connection(true))?;

        Ok(format!("{:02x}", self.engine.negotiated_version()))
    }

    /// Full version/capabilities/algorithms negotiation. Idempotent: a
    /// second call on a connected session is a logged no-op.
    pub fn initialize_and_connect(&mut self) -> Result<(), ProtocolError> {
        self.ensure_context()?;

        if self.is_connected() {
            tracing::debug!("connection already established");
            return Ok(());
        }

        tracing::debug!("sending GET_VERSION, GET_CAPABILITIES, NEGOTIATE_ALGORITHMS");
        fail_on_error(self.engine.init_connection(false))?;
        self.state = SessionState::ConnectionEstablished;
        Ok(())
    }

    /// Protocol version negotiated on an established connection.
    pub fn negotiated_version(&self) -> Result<String, ProtocolError> {
        self.ensure_connected()?;
        Ok(format!("{:02x}", self.engine.negotiated_version()))
    }

    pub fn capability_supported(&self, responder_flag: u32) -> Result<bool, ProtocolError> {
        self.ensure_connected()?;
        Ok(self.engine.capability_supported(responder_flag))
    }

    pub fn get_digests(&mut self) -> Result<DigestsResponse, ProtocolError> {
        self.ensure_connected()?;

        tracing::debug!("sending GET_DIGESTS");
        let mut out = DigestsOut::default();
        fail_on_error(self.engine.get_digests(&mut out))?;

        let populated = out.slot_mask.count_ones() as usize;
        if out.buffer.len() < populated * SHA384_LEN {
            return Err(ProtocolError::InternalException);
        }

        let digests = out.buffer[..populated * SHA384_LEN]
            .chunks_exact(SHA384_LEN)
            .map(|chunk| {
                let mut digest = [0u8; SHA384_LEN];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();

        Ok(DigestsResponse {
            slot_mask: out.slot_mask,
            digests,
        })
    }

    pub fn get_certificate_chain(&mut self, slot_id: u8) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;

        tracing::debug!(slot_id, "sending GET_CERTIFICATE");
        let mut chain = Vec::new();
        fail_on_error(self.engine.get_certificate(slot_id, &mut chain))?;
        tracing::debug!(len = chain.len(), "certificate chain received");
        Ok(chain)
    }

    /// Request all measurement blocks. Records the SHA-384 of the raw
    /// record as the expected measurement hash for this session; secure
    /// session establishment later compares against it byte for byte.
    pub fn get_measurements(
        &mut self,
        slot_id: u8,
        require_signature: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;

        let request_attributes = if require_signature {
            tracing::debug!("requesting signature over measurements");
            MEASUREMENTS_REQUEST_GENERATE_SIGNATURE
        } else {
            tracing::debug!("skipping signature over measurements");
            0
        };

        tracing::debug!(slot_id, "sending GET_MEASUREMENTS");
        let mut out = MeasurementsOut::default();
        fail_on_error(self.engine.get_measurements(
            request_attributes,
            MEASUREMENTS_OPERATION_ALL,
            slot_id,
            &mut out,
        ))?;

        let mut hash = [0u8; SHA384_LEN];
        hash.copy_from_slice(&Sha384::digest(&out.record));
        self.expected_measurement_hash = Some(hash);

        tracing::debug!(blocks = out.number_of_blocks, len = out.record.len(), "measurements received");
        Ok(out.record)
    }

    /// KEY_EXCHANGE. The measurement hash reported by the responder must
    /// equal the hash recorded by [`get_measurements`]; a mismatch or an
    /// unset expected hash both fail establishment.
    ///
    /// [`get_measurements`]: SpdmSession::get_measurements
    pub fn start_secure_session(&mut self, measurement_slot_id: u8) -> Result<(), ProtocolError> {
        self.ensure_connected()?;

        tracing::debug!(measurement_slot_id, "sending KEY_EXCHANGE");
        let mut out = SessionOut::default();
        let status = self.engine.start_session(
            KEY_EXCHANGE_ALL_MEASUREMENTS_HASH,
            measurement_slot_id,
            0,
            &mut out,
        );

        match self.expected_measurement_hash {
            Some(expected) => {
                if out.measurement_hash != expected {
                    tracing::error!("measurement hash mismatch");
                    return Err(ProtocolError::InternalException);
                }
            }
            None => {
                tracing::error!("expected measurement hash was never recorded");
                return Err(ProtocolError::InternalException);
            }
        }

        fail_on_error(status)?;

        if out.session_id == 0 {
            return Err(ProtocolError::SecureSessionInitFailed);
        }

        tracing::debug!(session_id = out.session_id, "secure session established");
        self.secure_session_id = out.session_id;
        Ok(())
    }

    /// Vendor-defined request/response under the secure session.
    pub fn send_receive_in_session(&mut self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;
        self.ensure_secure_session()?;

        tracing::debug!(len = payload.len(), "sending VENDOR_DEFINED_REQUEST in session");
        let mut response = Vec::new();
        fail_on_error(
            self.engine
                .send_receive_in_session(self.secure_session_id, payload, &mut response),
        )?;
        Ok(response)
    }

    /// SET_CERTIFICATE: install an externally supplied authority chain into
    /// a device slot.
    pub fn set_certificate_chain(
        &mut self,
        slot_id: u8,
        certificate_chain: &[Vec<u8>],
    ) -> Result<(), ProtocolError> {
        self.ensure_connected()?;

        tracing::debug!(slot_id, certs = certificate_chain.len(), "sending SET_CERTIFICATE");
        let image = SetCertificateImage::build(certificate_chain)?;
        fail_on_error(
            self.engine
                .set_certificate(slot_id, image.image(), image.chain_len()),
        )
    }

    pub fn stop_secure_session(&mut self) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        self.ensure_secure_session()?;

        tracing::debug!("sending END_SESSION");
        fail_on_error(self.engine.stop_session(self.secure_session_id, 0))?;
        self.secure_session_id = 0;
        Ok(())
    }

    /// Release the native context. Safe to call repeatedly and on a
    /// partially initialized session.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.engine.deinit();
        self.secure_session_id = 0;
        self.state = SessionState::Closed;
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::ConnectionNotEstablished);
        }
        Ok(())
    }

    fn ensure_secure_session(&self) -> Result<(), ProtocolError> {
        if !self.is_secure_session_established() {
            return Err(ProtocolError::SecureSessionNotEstablished);
        }
        Ok(())
    }
}

impl Drop for SpdmSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use std::sync::Mutex;

    use super::callbacks::CollaboratorError;
    use super::*;
    use crate::engine::mock::{MockDevice, MockEngine};

    /// Loopback transport: every outbound message is answered with a fixed
    /// acknowledgement on the next receive.
    struct LoopbackTransport {
        pending: Mutex<Vec<Vec<u8>>>,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                pending: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageTransport for LoopbackTransport {
        fn send_message(&self, _ctx: &[u8], payload: &[u8]) -> Result<(), CollaboratorError> {
            self.pending.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn receive_response(&self) -> Result<Option<Vec<u8>>, CollaboratorError> {
            Ok(self.pending.lock().unwrap().pop().map(|_| vec![0xA5; 8]))
        }
    }

    fn session_with(device: MockDevice) -> SpdmSession {
        SpdmSession::new(
            Box::new(MockEngine::new(device)),
            Arc::new(LoopbackTransport::new()),
            None,
            SpdmParameters::default(),
            Some(vec![0x30, 0x82, 0x01, 0x00]),
        )
    }

    #[test]
    fn operations_rejected_before_connect() {
        let mut session = session_with(MockDevice::default());
        assert!(matches!(
            session.get_digests(),
            Err(ProtocolError::ConnectionNotEstablished)
        ));
        assert!(matches!(
            session.get_certificate_chain(0),
            Err(ProtocolError::ConnectionNotEstablished)
        ));
        assert!(matches!(
            session.start_secure_session(0),
            Err(ProtocolError::ConnectionNotEstablished)
        ));
    }

    #[test]
    fn connect_is_idempotent() {
        let mut session = session_with(MockDevice::default());
        session.initialize_and_connect().unwrap();
        session.initialize_and_connect().unwrap();
        assert!(session.is_connected());
    }

    #[test]
    fn get_version_reports_responder_version() {
        let mut session = session_with(MockDevice::default());
        assert_eq!(session.get_version().unwrap(), "12");
    }

    #[test]
    fn prepare_failure_is_init_failed() {
        let device = MockDevice {
            fail_prepare: true,
            ..MockDevice::default()
        };
        let mut session = session_with(device);
        assert!(matches!(
            session.initialize_and_connect(),
            Err(ProtocolError::InitFailed)
        ));
    }

    #[test]
    fn digests_split_per_set_bit() {
        let device = MockDevice {
            slot_mask: 0b0000_0101,
            ..MockDevice::default()
        };
        let mut session = session_with(device);
        session.initialize_and_connect().unwrap();

        let digests = session.get_digests().unwrap();
        assert_eq!(digests.slot_mask, 0b0000_0101);
        assert_eq!(digests.digests.len(), 2);
    }

    #[test]
    fn measurement_hash_binds_secure_session() {
        let mut session = session_with(MockDevice::default());
        session.initialize_and_connect().unwrap();

        session.get_measurements(0, true).unwrap();
        session.start_secure_session(0).unwrap();
        assert!(session.is_secure_session_established());

        session.stop_secure_session().unwrap();
        assert!(!session.is_secure_session_established());
        assert!(session.is_connected());
    }

    #[test]
    fn tampered_measurement_hash_fails_establishment() {
        let measurements = vec![0x5Au8; 96];
        let mut tampered = [0u8; SHA384_LEN];
        tampered.copy_from_slice(&Sha384::digest(&measurements));
        tampered[0] ^= 0x01;

        let device = MockDevice {
            measurements,
            key_exchange_measurement_hash: Some(tampered),
            ..MockDevice::default()
        };
        let mut session = session_with(device);
        session.initialize_and_connect().unwrap();
        session.get_measurements(0, true).unwrap();

        assert!(matches!(
            session.start_secure_session(0),
            Err(ProtocolError::InternalException)
        ));
        assert!(!session.is_secure_session_established());
    }

    #[test]
    fn unset_measurement_hash_fails_establishment() {
        let mut session = session_with(MockDevice::default());
        session.initialize_and_connect().unwrap();

        assert!(matches!(
            session.start_secure_session(0),
            Err(ProtocolError::InternalException)
        ));
    }

    #[test]
    fn zero_session_id_fails_establishment() {
        let device = MockDevice {
            session_id: 0,
            ..MockDevice::default()
        };
        let mut session = session_with(device);
        session.initialize_and_connect().unwrap();
        session.get_measurements(0, true).unwrap();

        assert!(matches!(
            session.start_secure_session(0),
            Err(ProtocolError::SecureSessionInitFailed)
        ));
    }

    #[test]
    fn session_traffic_requires_secure_session() {
        let mut session = session_with(MockDevice::default());
        session.initialize_and_connect().unwrap();

        assert!(matches!(
            session.send_receive_in_session(b"payload"),
            Err(ProtocolError::SecureSessionNotEstablished)
        ));
    }

    #[test]
    fn close_is_safe_to_repeat() {
        let mut session = session_with(MockDevice::default());
        session.initialize_and_connect().unwrap();
        session.close();
        session.close();
        assert!(matches!(
            session.get_digests(),
            Err(ProtocolError::ConnectionNotEstablished)
        ));
    }
}
