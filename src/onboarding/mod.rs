//! Stateless onboarding handler chain.
//!
//! Every request carries the sealed context from the previous round trip
//! plus the batch of device responses collected since; every response
//! carries the next commands plus a freshly sealed context. Each stage is a
//! pure function of `(context, responses) -> (commands, new context)`; the
//! number of accumulated responses decides which stage runs, first match
//! wins.

pub mod context;
mod handlers;
pub mod programmer;

use std::sync::Arc;

use crate::bridge::SpdmBridge;
use crate::error::{OnboardingError, Result};
use crate::trust::archive::ArchiveStore;
use crate::trust::PufType;

pub use self::context::{ContextSealer, OnboardingContext};
pub use self::programmer::{MessageType, ProgrammerCommand, ProgrammerResponse};

/// One stateless onboarding call.
#[derive(Debug, Clone)]
pub struct OnboardingRequest {
    pub api_version: u32,
    pub puf_type: PufType,
    /// Device certificate slot receiving the authority chain.
    pub slot_id: u8,
    pub force_enrollment: bool,
    /// Command-support bitmask the device reported.
    pub supported_commands: u32,
    /// Sealed context echoed from the previous response; absent on the
    /// first call of a flow.
    pub context: Option<Vec<u8>>,
    /// Device responses accumulated since the previous call.
    pub responses: Vec<ProgrammerResponse>,
}

/// Whether the flow needs further round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingStatus {
    InProgress,
    Done,
}

/// Commands for the device plus the context for the next call.
#[derive(Debug, Clone)]
pub struct OnboardingResponse {
    pub api_version: u32,
    pub status: OnboardingStatus,
    pub commands: Vec<ProgrammerCommand>,
    /// Freshly sealed context; absent once the flow is done.
    pub context: Option<Vec<u8>>,
}

/// The stages, in dispatch order. Which one runs is decided by how many
/// device responses the request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// No responses yet: open a fresh flow.
    Create,
    /// One response: the reply to the previous protocol message.
    ProtocolCommunication,
    /// Four responses: chip id, id code, attestation certificate and the
    /// final protocol message echo.
    ProtocolCompletion,
}

impl Stage {
    fn select(request: &OnboardingRequest) -> std::result::Result<Stage, OnboardingError> {
        const STAGES: &[(Stage, fn(&OnboardingRequest) -> bool)] = &[
            (Stage::Create, |r| r.responses.is_empty()),
            (Stage::ProtocolCommunication, |r| r.responses.len() == 1),
            (Stage::ProtocolCompletion, |r| r.responses.len() == 4),
        ];

        STAGES
            .iter()
            .find(|(_, matches)| matches(request))
            .map(|(stage, _)| *stage)
            .ok_or(OnboardingError::NoStageMatched)
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::ProtocolCommunication => "protocol-communication",
            Stage::ProtocolCompletion => "protocol-completion",
        }
    }
}

/// Entry point for onboarding calls.
pub struct OnboardingService {
    pub(crate) bridge: Arc<SpdmBridge>,
    pub(crate) sealer: Arc<dyn ContextSealer>,
    pub(crate) archive: Arc<dyn ArchiveStore>,
}

impl OnboardingService {
    pub fn new(
        bridge: Arc<SpdmBridge>,
        sealer: Arc<dyn ContextSealer>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self {
            bridge,
            sealer,
            archive,
        }
    }

    /// Route one request to its stage.
    ///
    /// The supported-commands and response-status gates run on every call
    /// before stage dispatch.
    pub async fn handle(&self, request: OnboardingRequest) -> Result<OnboardingResponse> {
        self.verify_supported_commands(&request)?;
        self.verify_response_statuses(&request)?;

        let stage = Stage::select(&request)?;
        tracing::debug!(stage = stage.name(), responses = request.responses.len(), "dispatching");

        match stage {
            Stage::Create => self.stage_create(&request).await,
            Stage::ProtocolCommunication => self.stage_protocol_communication(&request).await,
            Stage::ProtocolCompletion => self.stage_protocol_completion(&request).await,
        }
    }
}
