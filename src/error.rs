use crate::engine::RawStatus;
use crate::trust::PufType;

/// Errors from the attestation protocol driver and the native engine binding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to initialize protocol context")]
    InitFailed,

    #[error("protocol command failed with engine status 0x{:08X}", .0.value())]
    CommandFailed(RawStatus),

    #[error("protocol not supported by responder")]
    NotSupported,

    #[error("internal exception reported by engine")]
    InternalException,

    #[error("secure session not initialized by responder")]
    SecureSessionInitFailed,

    #[error("connection not established")]
    ConnectionNotEstablished,

    #[error("secure session not established")]
    SecureSessionNotEstablished,

    #[error("unsupported responder protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("responder does not support required capability: {0}")]
    MissingCapability(&'static str),

    #[error("certificate chain for provisioning is empty")]
    EmptyCertificateChain,

    #[error("native engine library unavailable: {0}")]
    EngineUnavailable(String),
}

/// Errors from the bridge that pumps the driver on behalf of a stateless caller.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("a protocol flow is already running")]
    AlreadyRunning,

    #[error("protocol flow terminated abnormally: {0}")]
    TerminatedAbnormally(String),

    #[error("no protocol message was ever produced; bridge presumed dead")]
    UnrecoverableEmpty,

    #[error("outbound queue momentarily empty; flow still running")]
    Empty,

    #[error("inbound queue rejected the device response")]
    ResponseRejected,
}

/// Errors from trust-flow selection and certificate-chain assembly.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("trust chain broken: {0}")]
    TrustChainBroken(String),

    #[error("unsupported PUF type: {0}")]
    UnsupportedPufType(PufType),

    #[error("IID trust-anchor path requested for PUF type {0}")]
    IidPathForNonIid(PufType),

    #[error("certificate bundle not found in cache")]
    ArchiveMissing,

    #[error("mandatory file {0} is missing from the cached bundle")]
    RequiredFileMissing(String),

    #[error("failed to parse X.509 certificate {0}")]
    CertificateParse(String),

    #[error("cached bundle is not a readable archive: {0}")]
    ArchiveCorrupt(String),
}

/// Errors from the stateless onboarding handler chain.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("failed to open onboarding context")]
    ContextOpenFailed,

    #[error("failed to seal onboarding context")]
    ContextSealFailed,

    #[error("expected {expected} device responses, got {actual}")]
    UnexpectedResponseCount { expected: usize, actual: usize },

    #[error("device does not support the mandatory command set")]
    CommandNotSupported,

    #[error("device family {0} does not support authority provisioning")]
    FamilyNotSupported(String),

    #[error("device reported error status 0x{0:08X} in a prior response")]
    DeviceStatusError(u32),

    #[error("no onboarding stage matched the request")]
    NoStageMatched,

    #[error("device response is malformed: {0}")]
    MalformedResponse(String),

    #[error("enrollment certificate is invalid: {0}")]
    InvalidEnrollmentCertificate(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Onboarding(#[from] OnboardingError),
}

pub type Result<T> = std::result::Result<T, Error>;
