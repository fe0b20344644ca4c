//! Programmer command/response model.
//!
//! One command/response pair corresponds to exactly one physical exchange
//! with the device; call boundaries are the only synchronization points.
//! Message-type values are wire-compatible with the programmer and must
//! hold their historical numbering.

use serde::{Deserialize, Serialize};

use crate::error::OnboardingError;
use crate::trust::{Family, PufType};

/// Command tags understood by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    SendPacket,
    PushWrappedKey,
    PushWrappedKeyUserIid,
    PushWrappedKeyUdsIid,
    PushHelperDataUdsIid,
    PushHelperDataUdsIntel,
}

impl MessageType {
    pub fn value(&self) -> u32 {
        match self {
            MessageType::SendPacket => 0,
            MessageType::PushWrappedKey => 1,
            MessageType::PushWrappedKeyUserIid => 2,
            MessageType::PushWrappedKeyUdsIid => 3,
            MessageType::PushHelperDataUdsIid => 4,
            MessageType::PushHelperDataUdsIntel => 5,
        }
    }

    /// Whether this command is set in the device-reported support bitmask.
    pub fn is_set_in(&self, supported_commands: u32) -> bool {
        supported_commands & (1 << self.value()) != 0
    }

    pub fn all_set_in(types: &[MessageType], supported_commands: u32) -> bool {
        types.iter().all(|t| t.is_set_in(supported_commands))
    }
}

/// Commands every onboarding flow requires.
pub fn required_message_types() -> &'static [MessageType] {
    &[MessageType::SendPacket]
}

/// The PUF-type-specific command authority provisioning requires, or `None`
/// for trust-anchor types that cannot be provisioned.
pub fn message_type_for_set_authority(puf_type: PufType) -> Option<MessageType> {
    match puf_type {
        PufType::Iid | PufType::Intel | PufType::Efuse => Some(MessageType::SendPacket),
        PufType::IidUser => None,
    }
}

/// One command sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammerCommand {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl ProgrammerCommand {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn send_packet(payload: Vec<u8>) -> Self {
        Self::new(MessageType::SendPacket, payload)
    }
}

/// Status code of a successful device response.
pub const RESPONSE_STATUS_OK: u32 = 0;

/// One response received from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammerResponse {
    pub payload: Vec<u8>,
    pub status: u32,
}

impl ProgrammerResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            payload,
            status: RESPONSE_STATUS_OK,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RESPONSE_STATUS_OK
    }
}

/// Verify the exact response count a stage expects.
pub fn verify_response_count(
    responses: &[ProgrammerResponse],
    expected: usize,
) -> Result<(), OnboardingError> {
    if responses.len() != expected {
        return Err(OnboardingError::UnexpectedResponseCount {
            expected,
            actual: responses.len(),
        });
    }
    Ok(())
}

/// Sequential reader over a batch of responses.
pub struct ResponseAdapter<'a> {
    responses: std::slice::Iter<'a, ProgrammerResponse>,
}

impl<'a> ResponseAdapter<'a> {
    pub fn new(responses: &'a [ProgrammerResponse]) -> Self {
        Self {
            responses: responses.iter(),
        }
    }

    pub fn next(&mut self) -> Result<&'a [u8], OnboardingError> {
        self.responses
            .next()
            .map(|r| r.payload.as_slice())
            .ok_or_else(|| OnboardingError::MalformedResponse("response batch exhausted".to_string()))
    }
}

const CMD_GET_CHIPID: u32 = 0x0012;
const CMD_GET_IDCODE: u32 = 0x0010;
const CMD_GET_ATTESTATION_CERTIFICATE: u32 = 0x0181;

const UID_LEN: usize = 8;

fn command_payload(command: u32) -> Vec<u8> {
    command.to_le_bytes().to_vec()
}

/// Chip-id read: yields the device's 8-byte unique id.
pub struct GetChipId;

impl GetChipId {
    pub fn create() -> ProgrammerCommand {
        tracing::debug!("preparing GET_CHIPID");
        ProgrammerCommand::send_packet(command_payload(CMD_GET_CHIPID))
    }

    pub fn retrieve(payload: &[u8]) -> Result<String, OnboardingError> {
        if payload.len() < UID_LEN {
            return Err(OnboardingError::MalformedResponse(format!(
                "chip-id response too short: {} bytes",
                payload.len()
            )));
        }
        let mut uid = [0u8; UID_LEN];
        uid.copy_from_slice(&payload[..UID_LEN]);
        uid.reverse();

        let uid = hex::encode_upper(uid);
        tracing::debug!(uid = %uid, "received chip id");
        Ok(uid)
    }
}

/// ID-code read: yields the device family.
pub struct GetIdCode;

impl GetIdCode {
    pub fn create() -> ProgrammerCommand {
        tracing::debug!("preparing GET_IDCODE");
        ProgrammerCommand::send_packet(command_payload(CMD_GET_IDCODE))
    }

    pub fn retrieve(payload: &[u8]) -> Result<Family, OnboardingError> {
        if payload.len() < 4 {
            return Err(OnboardingError::MalformedResponse(format!(
                "id-code response too short: {} bytes",
                payload.len()
            )));
        }

        let family_id = payload[3];
        tracing::debug!(family_id, "received JTAG id code");
        Family::from_id(family_id).ok_or_else(|| {
            OnboardingError::MalformedResponse(format!("unknown family id 0x{family_id:02X}"))
        })
    }
}

/// Attestation-certificate read: yields the enrollment certificate the
/// device presents, if it has one.
pub struct GetAttestationCertificate;

impl GetAttestationCertificate {
    pub fn create() -> ProgrammerCommand {
        tracing::debug!("preparing GET_ATTESTATION_CERTIFICATE");
        ProgrammerCommand::send_packet(command_payload(CMD_GET_ATTESTATION_CERTIFICATE))
    }

    pub fn retrieve(payload: &[u8]) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return None;
        }
        Some(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_bitmask_membership() {
        let mask = 0b0000_0001;
        assert!(MessageType::SendPacket.is_set_in(mask));
        assert!(!MessageType::PushWrappedKey.is_set_in(mask));

        assert!(MessageType::all_set_in(required_message_types(), mask));
        assert!(!MessageType::all_set_in(
            &[MessageType::SendPacket, MessageType::PushHelperDataUdsIid],
            mask
        ));
    }

    #[test]
    fn set_authority_command_per_puf_type() {
        assert_eq!(
            message_type_for_set_authority(PufType::Efuse),
            Some(MessageType::SendPacket)
        );
        assert_eq!(message_type_for_set_authority(PufType::IidUser), None);
    }

    #[test]
    fn chip_id_roundtrip() {
        let payload = [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
        assert_eq!(GetChipId::retrieve(&payload).unwrap(), "0011223344556677");
    }

    #[test]
    fn chip_id_rejects_short_response() {
        assert!(matches!(
            GetChipId::retrieve(&[0x01, 0x02]),
            Err(OnboardingError::MalformedResponse(_))
        ));
    }

    #[test]
    fn id_code_maps_family() {
        assert_eq!(
            GetIdCode::retrieve(&[0x00, 0x10, 0x20, 0x34]).unwrap(),
            Family::Agilex
        );
        assert!(GetIdCode::retrieve(&[0x00, 0x10, 0x20, 0xFF]).is_err());
    }

    #[test]
    fn attestation_certificate_absent_when_empty() {
        assert_eq!(GetAttestationCertificate::retrieve(&[]), None);
        assert_eq!(
            GetAttestationCertificate::retrieve(&[0x30, 0x82]),
            Some(vec![0x30, 0x82])
        );
    }

    #[test]
    fn response_count_verification() {
        let responses = vec![ProgrammerResponse::ok(vec![1]), ProgrammerResponse::ok(vec![2])];
        assert!(verify_response_count(&responses, 2).is_ok());
        assert!(matches!(
            verify_response_count(&responses, 4),
            Err(OnboardingError::UnexpectedResponseCount {
                expected: 4,
                actual: 2
            })
        ));
    }
}
