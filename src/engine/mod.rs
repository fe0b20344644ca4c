//! Binding surface for the native SPDM requester engine.
//!
//! The engine is an opaque native library driven through a narrow call
//! surface plus two callback slots it invokes while executing a command:
//! "send/receive raw protocol bytes" and "sign these bytes locally". The
//! [`SpdmEngine`] trait captures that surface so the protocol driver can be
//! exercised against a scripted in-memory responder (`mock` feature) or the
//! real shared library (`libspdm` feature).

#[cfg(feature = "libspdm")]
pub mod libspdm;

#[cfg(feature = "mock")]
pub mod mock;

use std::sync::Arc;

use crate::driver::callbacks::EngineCallbacks;

/// Raw status word returned by every engine call.
///
/// Values never travel past the driver boundary; the driver translates them
/// into [`crate::error::ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatus(u32);

impl RawStatus {
    pub const SUCCESS: RawStatus = RawStatus(0x0000_0000);
    /// Responder does not speak the protocol (also used by the receive
    /// callback to signal an empty device response).
    pub const SPDM_NOT_SUPPORTED: RawStatus = RawStatus(0x8001_000A);
    /// Engine-internal failure, including collaborator failures surfaced
    /// through the callback boundary.
    pub const SPDM_INTERNAL_EXCEPTION: RawStatus = RawStatus(0x8001_000B);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    pub const fn is_success(&self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

/// Buffer sizing, taken from the native wrapper build.
pub const SENDER_RECEIVE_BUFFER_SIZE: u32 = 20064;
pub const MAX_SPDM_BUFFER_SIZE: usize = 20000;
pub const MAX_LOCAL_CERTIFICATE_CHAIN_SIZE: usize = 8192;

pub const SHA384_LEN: usize = 48;
pub const MAX_SLOT_COUNT: u8 = 8;
pub const DEFAULT_SLOT_ID: u8 = 0;
pub const DEFAULT_CT_EXPONENT: u8 = 0x0E;

/// GET_MEASUREMENTS request attributes.
pub const MEASUREMENTS_REQUEST_GENERATE_SIGNATURE: u8 = 0x01;
pub const MEASUREMENTS_OPERATION_ALL: u8 = 0xFF;

/// KEY_EXCHANGE measurement-summary-hash selectors.
pub const KEY_EXCHANGE_ALL_MEASUREMENTS_HASH: u8 = 0xFF;

/// Negotiated-algorithm identifiers.
pub const MEASUREMENT_SPEC_DMTF: u8 = 0x01;
pub const BASE_ASYM_ALGO_ECDSA_P384: u32 = 0x80;
pub const BASE_HASH_ALGO_SHA_384: u32 = 0x02;
pub const DHE_GROUP_SECP384R1: u16 = 0x10;
pub const AEAD_CIPHER_SUITE_AES_256_GCM: u16 = 0x02;
pub const KEY_SCHEDULE_HMAC_HASH: u16 = 0x01;
pub const OPAQUE_DATA_FORMAT_1: u8 = 0x02;

/// Requester capability flags advertised during GET_CAPABILITIES.
pub const REQUEST_FLAGS_CERT_CAP: u32 = 0x0000_0002;
pub const REQUEST_FLAGS_ENCRYPT_CAP: u32 = 0x0000_0040;
pub const REQUEST_FLAGS_MAC_CAP: u32 = 0x0000_0080;
pub const REQUEST_FLAGS_MUT_AUTH_CAP: u32 = 0x0000_0100;
pub const REQUEST_FLAGS_KEY_EX_CAP: u32 = 0x0000_0200;
pub const REQUEST_FLAGS_ENCAP_CAP: u32 = 0x0000_1000;

/// Responder capability flags probed after connection setup.
pub const RESPONSE_FLAGS_KEY_EX_CAP: u32 = 0x0000_0200;

/// One local operating parameter pushed into the engine before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineParameter {
    CtExponent(u8),
    CapabilityFlags(u32),
    MeasurementSpec(u8),
    BaseAsymAlgo(u32),
    BaseHashAlgo(u32),
    DheNamedGroup(u16),
    AeadCipherSuite(u16),
    ReqBaseAsymAlgo(u16),
    KeySchedule(u16),
    OtherParamsSupport(u8),
}

/// Output of a GET_DIGESTS exchange: one bit per populated slot, one
/// fixed-length digest per set bit, concatenated.
#[derive(Debug, Default, Clone)]
pub struct DigestsOut {
    pub slot_mask: u8,
    pub buffer: Vec<u8>,
}

/// Output of a GET_MEASUREMENTS exchange.
#[derive(Debug, Default, Clone)]
pub struct MeasurementsOut {
    pub number_of_blocks: u8,
    pub record: Vec<u8>,
}

/// Output of a KEY_EXCHANGE.
#[derive(Debug, Clone)]
pub struct SessionOut {
    pub session_id: u32,
    pub heartbeat_period: u8,
    pub measurement_hash: [u8; SHA384_LEN],
}

impl Default for SessionOut {
    fn default() -> Self {
        Self {
            session_id: 0,
            heartbeat_period: 0,
            measurement_hash: [0u8; SHA384_LEN],
        }
    }
}

/// Call surface of the native requester engine.
///
/// All methods are synchronous: the engine blocks inside each command while
/// its send/receive callbacks complete the wire exchanges. Implementations
/// must not be shared across sessions; the driver owns its engine
/// exclusively.
pub trait SpdmEngine: Send {
    /// Size of the opaque context the engine needs allocated.
    fn context_size(&self) -> usize;

    /// Register the callback slots. Must happen before [`prepare_context`].
    ///
    /// [`prepare_context`]: SpdmEngine::prepare_context
    fn register_callbacks(&mut self, callbacks: Arc<EngineCallbacks>);

    /// Allocate and initialize the native context.
    fn prepare_context(&mut self, sender_receive_buffer_size: u32) -> RawStatus;

    /// Scratch-buffer size the prepared context requires.
    fn required_scratch_size(&mut self) -> usize;

    /// Pin a scratch buffer of the given size for the context.
    fn set_scratch_buffer(&mut self, size: usize);

    /// Push one local operating parameter.
    fn set_parameter(&mut self, parameter: EngineParameter) -> RawStatus;

    /// Install the local certificate chain (already framed for
    /// provisioning) into the given local slot.
    fn set_local_certificate_chain(&mut self, slot_id: u8, encoded_chain: &[u8]) -> RawStatus;

    /// Run GET_VERSION only (`version_only`) or the full
    /// version/capabilities/algorithms negotiation.
    fn init_connection(&mut self, version_only: bool) -> RawStatus;

    /// Protocol version byte the responder reported.
    fn negotiated_version(&self) -> u8;

    /// Whether the responder advertised the given capability flag.
    fn capability_supported(&self, responder_flag: u32) -> bool;

    fn get_digests(&mut self, out: &mut DigestsOut) -> RawStatus;

    /// Fetch the full certificate chain for a slot. The engine truncates at
    /// [`MAX_SPDM_BUFFER_SIZE`].
    fn get_certificate(&mut self, slot_id: u8, out: &mut Vec<u8>) -> RawStatus;

    fn get_measurements(
        &mut self,
        request_attributes: u8,
        operation: u8,
        slot_id: u8,
        out: &mut MeasurementsOut,
    ) -> RawStatus;

    /// SET_CERTIFICATE: install an authority chain image into a device slot.
    /// `chain_len` is the unpadded image length.
    fn set_certificate(&mut self, slot_id: u8, chain_image: &[u8], chain_len: usize) -> RawStatus;

    /// KEY_EXCHANGE: establish a secure session bound to the measurement
    /// summary of `slot_id`.
    fn start_session(
        &mut self,
        measurement_hash_type: u8,
        slot_id: u8,
        session_policy: u8,
        out: &mut SessionOut,
    ) -> RawStatus;

    fn stop_session(&mut self, session_id: u32, attributes: u8) -> RawStatus;

    /// Vendor-defined request/response under an established secure session.
    fn send_receive_in_session(
        &mut self,
        session_id: u32,
        request: &[u8],
        response: &mut Vec<u8>,
    ) -> RawStatus;

    /// Release the native context. Safe to call more than once.
    fn deinit(&mut self);
}
