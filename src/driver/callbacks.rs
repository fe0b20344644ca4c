//! Translation layer between the native engine's callback slots and the
//! injected collaborators.
//!
//! The engine has no error channel other than its own status words, so every
//! collaborator failure is caught here and converted into an engine status
//! instead of propagating.

use std::sync::Arc;

use crate::engine::RawStatus;

/// Failure reported by an injected collaborator.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Physical transport for raw protocol messages.
///
/// The driver only ever touches this through the engine's callback slots;
/// the payloads are opaque PDUs produced and consumed by the engine.
pub trait MessageTransport: Send + Sync {
    /// Forward one outbound protocol message to the device.
    fn send_message(&self, session_context: &[u8], payload: &[u8]) -> Result<(), CollaboratorError>;

    /// Poll for the device's response. `Ok(None)` means no data arrived.
    fn receive_response(&self) -> Result<Option<Vec<u8>>, CollaboratorError>;
}

/// Local signing authority used when the engine requests a requester
/// signature during session establishment.
pub trait Signer: Send + Sync {
    fn sign(
        &self,
        data: &[u8],
        asym_algorithm: u16,
        hash_algorithm: u32,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

/// The two callback slots handed to the engine at context setup.
pub struct EngineCallbacks {
    transport: Arc<dyn MessageTransport>,
    signer: Option<Arc<dyn Signer>>,
}

impl EngineCallbacks {
    pub fn new(transport: Arc<dyn MessageTransport>, signer: Option<Arc<dyn Signer>>) -> Self {
        Self { transport, signer }
    }

    /// Send slot. Transport failures become an internal-exception status;
    /// the engine has no other way to observe them.
    pub fn device_send(&self, session_context: &[u8], request: &[u8]) -> RawStatus {
        match self.transport.send_message(session_context, request) {
            Ok(()) => RawStatus::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "sending protocol message failed");
                RawStatus::SPDM_INTERNAL_EXCEPTION
            }
        }
    }

    /// Receive slot. An empty response is translated into the engine's
    /// not-supported status: the wire has no "no data yet" signal, so
    /// absence is a hard failure at this layer and any retry policy lives
    /// above the driver.
    pub fn device_receive(&self) -> (RawStatus, Vec<u8>) {
        match self.transport.receive_response() {
            Ok(Some(response)) => (RawStatus::SUCCESS, response),
            Ok(None) => {
                tracing::error!("response from responder is empty");
                (RawStatus::SPDM_NOT_SUPPORTED, Vec::new())
            }
            Err(e) => {
                tracing::error!(error = %e, "receiving protocol message failed");
                (RawStatus::SPDM_INTERNAL_EXCEPTION, Vec::new())
            }
        }
    }

    /// Sign slot. Returns `None` (signalling failure to the engine) when no
    /// signer was configured or the signer errored.
    pub fn sign(&self, data: &[u8], asym_algorithm: u16, hash_algorithm: u32) -> Option<Vec<u8>> {
        let Some(signer) = self.signer.as_ref() else {
            tracing::error!("signature requested but no signer was configured");
            return None;
        };

        match signer.sign(data, asym_algorithm, hash_algorithm) {
            Ok(signature) => Some(signature),
            Err(e) => {
                tracing::error!(error = %e, "local signing failed");
                None
            }
        }
    }
}
