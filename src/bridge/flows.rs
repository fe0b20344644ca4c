//! Protocol flows executed by the bridge's background task.
//!
//! Each flow runs the full command sequence against one fresh driver
//! session and collapses its outcome into a [`FlowResult`]; errors never
//! escape the background task.

use crate::driver::SpdmSession;
use crate::engine::RESPONSE_FLAGS_KEY_EX_CAP;
use crate::error::ProtocolError;

/// Protocol version this service speaks (SPDM 1.2).
pub const SUPPORTED_VERSION: &str = "12";

/// A protocol sequence the bridge can run end to end.
pub enum FlowKind {
    /// GET_VERSION only: probe whether the responder speaks the supported
    /// protocol version.
    VersionCheck,
    /// Full negotiation plus a check that the responder can do key
    /// exchange.
    CapabilityCheck,
    /// Full negotiation followed by SET_CERTIFICATE of an authority chain
    /// into a device slot.
    SetAuthority {
        certificate_chain: Vec<Vec<u8>>,
        slot_id: u8,
    },
    /// Full attested secure-session sequence: digests, certificate chain,
    /// signed measurements, key exchange bound to the measurement hash, one
    /// vendor-defined exchange, teardown.
    SecureSessionProbe {
        measurement_slot_id: u8,
        payload: Vec<u8>,
    },
}

impl FlowKind {
    pub fn name(&self) -> &'static str {
        match self {
            FlowKind::VersionCheck => "version-check",
            FlowKind::CapabilityCheck => "capability-check",
            FlowKind::SetAuthority { .. } => "set-authority",
            FlowKind::SecureSessionProbe { .. } => "secure-session-probe",
        }
    }
}

/// Terminal outcome of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowResult {
    Success,
    Failure,
    AttestationFailed,
    UnsupportedCapability,
}

impl FlowResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FlowResult::Success)
    }
}

impl std::fmt::Display for FlowResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowResult::Success => "SUCCESS",
            FlowResult::Failure => "FAILURE",
            FlowResult::AttestationFailed => "ATTESTATION_FAILED",
            FlowResult::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
        };
        f.write_str(name)
    }
}

fn ensure_version_supported(version: &str) -> Result<(), ProtocolError> {
    if version != SUPPORTED_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version.to_string()));
    }
    Ok(())
}

fn connect_and_verify_version(session: &mut SpdmSession) -> Result<(), ProtocolError> {
    session.initialize_and_connect()?;
    let version = session.negotiated_version()?;
    tracing::debug!(version = %version, "responder initialized");
    ensure_version_supported(&version)
}

fn version_check(session: &mut SpdmSession) -> Result<(), ProtocolError> {
    let version = session.get_version()?;
    tracing::debug!(version = %version, "responder version");
    ensure_version_supported(&version)
}

fn capability_check(session: &mut SpdmSession) -> Result<(), ProtocolError> {
    connect_and_verify_version(session)?;

    if !session.capability_supported(RESPONSE_FLAGS_KEY_EX_CAP)? {
        tracing::debug!("responder lacks KEY_EX_CAP");
        return Err(ProtocolError::MissingCapability("KEY_EX_CAP"));
    }
    Ok(())
}

fn set_authority(
    session: &mut SpdmSession,
    certificate_chain: &[Vec<u8>],
    slot_id: u8,
) -> Result<(), ProtocolError> {
    connect_and_verify_version(session)?;
    tracing::info!(slot_id, "responder initialized for authority provisioning");
    session.set_certificate_chain(slot_id, certificate_chain)
}

fn secure_session_probe(
    session: &mut SpdmSession,
    measurement_slot_id: u8,
    payload: &[u8],
) -> Result<(), FlowResult> {
    let failure = |e: ProtocolError| {
        tracing::warn!(error = %e, "secure-session flow failed");
        FlowResult::Failure
    };
    let attestation_failure = |e: ProtocolError| {
        tracing::error!(error = %e, "attestation failed");
        FlowResult::AttestationFailed
    };

    connect_and_verify_version(session).map_err(failure)?;

    let digests = session.get_digests().map_err(attestation_failure)?;
    if digests.slot_mask & (1 << measurement_slot_id) == 0 {
        tracing::error!(slot_mask = digests.slot_mask, "measurement slot is not populated");
        return Err(FlowResult::AttestationFailed);
    }
    session
        .get_certificate_chain(measurement_slot_id)
        .map_err(attestation_failure)?;
    session
        .get_measurements(measurement_slot_id, true)
        .map_err(attestation_failure)?;
    session
        .start_secure_session(measurement_slot_id)
        .map_err(attestation_failure)?;

    let response = session.send_receive_in_session(payload).map_err(failure)?;
    if response.is_empty() {
        tracing::error!("in-session exchange returned an empty response");
        session.stop_secure_session().ok();
        return Err(FlowResult::Failure);
    }

    session.stop_secure_session().map_err(failure)
}

/// Run one flow to completion, collapsing every error into a result.
pub(crate) fn run(kind: &FlowKind, session: &mut SpdmSession) -> FlowResult {
    let outcome = match kind {
        FlowKind::VersionCheck => version_check(session).map_err(|e| match e {
            ProtocolError::NotSupported => {
                tracing::debug!("protocol not supported by responder");
                FlowResult::Failure
            }
            ProtocolError::UnsupportedVersion(version) => {
                tracing::debug!(version = %version, "unsupported responder version");
                FlowResult::Failure
            }
            e => {
                tracing::debug!(error = %e, "processing failed");
                FlowResult::Failure
            }
        }),
        FlowKind::CapabilityCheck => capability_check(session).map_err(|e| match e {
            ProtocolError::MissingCapability(name) => {
                tracing::debug!(capability = name, "capability not supported");
                FlowResult::UnsupportedCapability
            }
            e => {
                tracing::debug!(error = %e, "processing failed");
                FlowResult::Failure
            }
        }),
        FlowKind::SetAuthority {
            certificate_chain,
            slot_id,
        } => set_authority(session, certificate_chain, *slot_id).map_err(|e| {
            tracing::debug!(error = %e, "processing failed");
            FlowResult::Failure
        }),
        FlowKind::SecureSessionProbe {
            measurement_slot_id,
            payload,
        } => secure_session_probe(session, *measurement_slot_id, payload),
    };

    match outcome {
        Ok(()) => FlowResult::Success,
        Err(result) => result,
    }
}
