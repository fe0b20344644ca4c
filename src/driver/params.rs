//! Local operating parameters pushed into the engine before connecting.

use crate::engine::{
    EngineParameter, SpdmEngine, AEAD_CIPHER_SUITE_AES_256_GCM, BASE_ASYM_ALGO_ECDSA_P384,
    BASE_HASH_ALGO_SHA_384, DEFAULT_CT_EXPONENT, DHE_GROUP_SECP384R1, KEY_SCHEDULE_HMAC_HASH,
    MEASUREMENT_SPEC_DMTF, OPAQUE_DATA_FORMAT_1, REQUEST_FLAGS_CERT_CAP, REQUEST_FLAGS_ENCAP_CAP,
    REQUEST_FLAGS_ENCRYPT_CAP, REQUEST_FLAGS_KEY_EX_CAP, REQUEST_FLAGS_MAC_CAP,
    REQUEST_FLAGS_MUT_AUTH_CAP,
};
use crate::error::ProtocolError;

use super::fail_on_error;

/// Hash/signature/key-exchange algorithm identifiers and capability flags
/// the requester advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdmParameters {
    pub ct_exponent: u8,
    pub capability_flags: u32,
    pub measurement_spec: u8,
    pub base_asym_algo: u32,
    pub base_hash_algo: u32,
    pub dhe_named_group: u16,
    pub aead_cipher_suite: u16,
    pub req_base_asym_algo: u16,
    pub key_schedule: u16,
    pub other_params_support: u8,
}

impl Default for SpdmParameters {
    fn default() -> Self {
        Self {
            ct_exponent: DEFAULT_CT_EXPONENT,
            capability_flags: REQUEST_FLAGS_CERT_CAP
                | REQUEST_FLAGS_MAC_CAP
                | REQUEST_FLAGS_ENCAP_CAP
                | REQUEST_FLAGS_MUT_AUTH_CAP
                | REQUEST_FLAGS_ENCRYPT_CAP
                | REQUEST_FLAGS_KEY_EX_CAP,
            measurement_spec: MEASUREMENT_SPEC_DMTF,
            base_asym_algo: BASE_ASYM_ALGO_ECDSA_P384,
            base_hash_algo: BASE_HASH_ALGO_SHA_384,
            dhe_named_group: DHE_GROUP_SECP384R1,
            aead_cipher_suite: AEAD_CIPHER_SUITE_AES_256_GCM,
            req_base_asym_algo: BASE_ASYM_ALGO_ECDSA_P384 as u16,
            key_schedule: KEY_SCHEDULE_HMAC_HASH,
            other_params_support: OPAQUE_DATA_FORMAT_1,
        }
    }
}

impl SpdmParameters {
    /// Push every parameter into the engine, in the order the native
    /// library expects them.
    pub fn apply(&self, engine: &mut dyn SpdmEngine) -> Result<(), ProtocolError> {
        let parameters = [
            EngineParameter::CtExponent(self.ct_exponent),
            EngineParameter::CapabilityFlags(self.capability_flags),
            EngineParameter::MeasurementSpec(self.measurement_spec),
            EngineParameter::BaseAsymAlgo(self.base_asym_algo),
            EngineParameter::BaseHashAlgo(self.base_hash_algo),
            EngineParameter::DheNamedGroup(self.dhe_named_group),
            EngineParameter::AeadCipherSuite(self.aead_cipher_suite),
            EngineParameter::ReqBaseAsymAlgo(self.req_base_asym_algo),
            EngineParameter::KeySchedule(self.key_schedule),
            EngineParameter::OtherParamsSupport(self.other_params_support),
        ];

        for parameter in parameters {
            fail_on_error(engine.set_parameter(parameter))?;
        }
        Ok(())
    }
}
