//! Stage implementations for the onboarding chain.

use bytes::Bytes;

use crate::bridge::{FlowKind, FlowResult};
use crate::error::{BridgeError, Error, OnboardingError, Result, TrustError};
use crate::trust::{self, archive, DeviceId};

use super::context::{open_context, seal_context, OnboardingContext};
use super::programmer::{
    message_type_for_set_authority, required_message_types, verify_response_count,
    GetAttestationCertificate, GetChipId, GetIdCode, MessageType, ProgrammerCommand,
    ResponseAdapter,
};
use super::{OnboardingRequest, OnboardingResponse, OnboardingService, OnboardingStatus};

const COMMUNICATION_RESPONSES: usize = 1;
const COMPLETION_RESPONSES: usize = 4;

impl OnboardingService {
    /// Gate: the device-reported bitmask must be non-zero, cover the
    /// mandatory command set and the PUF-type-specific command.
    pub(super) fn verify_supported_commands(&self, request: &OnboardingRequest) -> Result<()> {
        tracing::debug!(
            supported_commands = request.supported_commands,
            "verifying supported commands"
        );

        if request.supported_commands == 0 {
            return Err(OnboardingError::CommandNotSupported.into());
        }

        let specific = message_type_for_set_authority(request.puf_type)
            .ok_or(OnboardingError::CommandNotSupported)?;

        let supported = MessageType::all_set_in(required_message_types(), request.supported_commands)
            && specific.is_set_in(request.supported_commands);
        if !supported {
            return Err(OnboardingError::CommandNotSupported.into());
        }
        Ok(())
    }

    /// Gate: every device response so far must carry a success status.
    pub(super) fn verify_response_statuses(&self, request: &OnboardingRequest) -> Result<()> {
        if let Some(failed) = request.responses.iter().find(|r| !r.is_ok()) {
            return Err(OnboardingError::DeviceStatusError(failed.status).into());
        }
        Ok(())
    }

    /// Stage 1: open a fresh flow. Starts the version-check flow, emits the
    /// identity read commands plus the first protocol message, and seals
    /// the initial context.
    pub(super) async fn stage_create(
        &self,
        request: &OnboardingRequest,
    ) -> Result<OnboardingResponse> {
        tracing::info!("creating onboarding session");

        self.bridge.ensure_not_running().await?;
        self.bridge.start(FlowKind::VersionCheck).await?;

        let mut commands = vec![
            GetChipId::create(),
            GetIdCode::create(),
            GetAttestationCertificate::create(),
        ];

        let message = self.bridge.next_message().await?;
        commands.push(ProgrammerCommand::send_packet(message.to_vec()));

        let context =
            OnboardingContext::new(request.puf_type, request.slot_id, request.force_enrollment);

        self.respond_in_progress(request, commands, &context)
    }

    /// Stage 2: pump one device response into the running flow. Either the
    /// flow produces the next protocol message, or it has ended and its
    /// result decides between failure and hand-off to the terminal stage.
    pub(super) async fn stage_protocol_communication(
        &self,
        request: &OnboardingRequest,
    ) -> Result<OnboardingResponse> {
        self.ensure_flow_running()?;
        let context = self.open_request_context(request)?;

        tracing::info!("parsing programmer responses");
        verify_response_count(&request.responses, COMMUNICATION_RESPONSES)?;

        let mut adapter = ResponseAdapter::new(&request.responses);
        self.bridge
            .push_response(Bytes::copy_from_slice(adapter.next()?))?;

        match self.bridge.try_next_message().await? {
            Some(message) => self.respond_in_progress(
                request,
                vec![ProgrammerCommand::send_packet(message.to_vec())],
                &context,
            ),
            None => {
                self.ensure_flow_succeeded()?;
                Ok(OnboardingResponse {
                    api_version: request.api_version,
                    status: OnboardingStatus::Done,
                    commands: Vec::new(),
                    context: None,
                })
            }
        }
    }

    /// Stage 3: attestation completed. Derives the device identity, parses
    /// the enrollment certificate, selects the trust flow, assembles the
    /// authority chain from the cache and opens the install flow.
    pub(super) async fn stage_protocol_completion(
        &self,
        request: &OnboardingRequest,
    ) -> Result<OnboardingResponse> {
        self.ensure_flow_running()?;
        let mut context = self.open_request_context(request)?;

        tracing::info!("parsing programmer responses");
        verify_response_count(&request.responses, COMPLETION_RESPONSES)?;

        let mut adapter = ResponseAdapter::new(&request.responses);
        let uid = GetChipId::retrieve(adapter.next()?)?;
        let family = GetIdCode::retrieve(adapter.next()?)?;
        let device = DeviceId::new(family, uid);

        tracing::info!(device = %device, puf_type = %context.puf_type, slot_id = context.slot_id, "onboarding device");

        if !family.supports_set_authority() {
            return Err(OnboardingError::FamilyNotSupported(family.to_string()).into());
        }
        if !self.archive.is_prefetched(&device).await {
            return Err(TrustError::ArchiveMissing.into());
        }

        let enrollment_der = GetAttestationCertificate::retrieve(adapter.next()?).ok_or_else(|| {
            OnboardingError::InvalidEnrollmentCertificate("certificate does not exist".to_string())
        })?;
        let enrollment_cert =
            trust::parse_certificate("device enrollment", &enrollment_der).map_err(|_| {
                OnboardingError::InvalidEnrollmentCertificate("certificate is unparseable".to_string())
            })?;
        let svn = trust::parse_svn(&enrollment_cert)?;
        tracing::info!(svn = %svn, "parsed enrollment certificate");

        self.bridge
            .push_response(Bytes::copy_from_slice(adapter.next()?))?;
        self.ensure_flow_drained_and_succeeded().await?;

        let bundle = self
            .archive
            .find(&device)
            .await?
            .ok_or(TrustError::ArchiveMissing)?;
        let assembled = archive::assemble_chain(
            &bundle,
            &device,
            context.puf_type,
            &svn,
            &enrollment_cert,
            context.force_enrollment,
        )?;
        tracing::debug!(flow = ?assembled.flow, certs = assembled.certificates.len(), "assembled authority chain");

        self.bridge
            .start(FlowKind::SetAuthority {
                certificate_chain: assembled.certificates,
                slot_id: context.slot_id,
            })
            .await?;

        let message = self.bridge.next_message().await?;

        context.device = Some(device);
        context.svn = Some(svn);

        self.respond_in_progress(
            request,
            vec![ProgrammerCommand::send_packet(message.to_vec())],
            &context,
        )
    }

    fn ensure_flow_running(&self) -> Result<()> {
        if !self.bridge.is_processing() {
            return Err(BridgeError::TerminatedAbnormally(
                "protocol task is not running".to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn open_request_context(&self, request: &OnboardingRequest) -> Result<OnboardingContext> {
        let sealed = request
            .context
            .as_deref()
            .ok_or(OnboardingError::ContextOpenFailed)?;
        Ok(open_context(self.sealer.as_ref(), sealed)?)
    }

    fn ensure_flow_succeeded(&self) -> Result<()> {
        let result = self.bridge.take_result().unwrap_or(FlowResult::Failure);
        tracing::debug!(%result, "protocol flow result");
        if !result.is_success() {
            return Err(BridgeError::TerminatedAbnormally(result.to_string()).into());
        }
        Ok(())
    }

    /// The finished flow must have no unconsumed outbound messages and a
    /// success result.
    async fn ensure_flow_drained_and_succeeded(&self) -> Result<()> {
        match self.bridge.try_next_message().await {
            Ok(None) => self.ensure_flow_succeeded(),
            Ok(Some(_)) => Err(BridgeError::TerminatedAbnormally(
                "more protocol messages than expected".to_string(),
            )
            .into()),
            Err(e) => Err(Error::Bridge(e)),
        }
    }

    fn respond_in_progress(
        &self,
        request: &OnboardingRequest,
        commands: Vec<ProgrammerCommand>,
        context: &OnboardingContext,
    ) -> Result<OnboardingResponse> {
        let sealed = seal_context(self.sealer.as_ref(), context)?;
        Ok(OnboardingResponse {
            api_version: request.api_version,
            status: OnboardingStatus::InProgress,
            commands,
            context: Some(sealed),
        })
    }
}
