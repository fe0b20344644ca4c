//! Device attestation and authority-chain onboarding over a stateless
//! request/response API.
//!
//! The crate reconciles three mismatched execution models: a synchronous
//! multi-message attestation protocol driven against a native engine
//! ([`driver`]), a transport that only moves one command/response pair per
//! call, and a server that holds no session state between calls
//! ([`onboarding`]). The [`bridge`] runs the driver on a background task
//! and feeds it one device response at a time; [`trust`] decides which
//! cached certificates form the authority chain installed on the device.

pub mod bridge;
pub mod driver;
pub mod engine;
pub mod error;
pub mod onboarding;
pub mod trust;

// Re-export key types at crate root for convenience.
pub use error::{Error, Result};

pub use bridge::{BridgeConfig, EngineFactory, FlowKind, FlowResult, SpdmBridge};
pub use driver::callbacks::{MessageTransport, Signer};
pub use driver::SpdmSession;
pub use engine::SpdmEngine;
pub use onboarding::{
    ContextSealer, OnboardingContext, OnboardingRequest, OnboardingResponse, OnboardingService,
};
pub use trust::archive::ArchiveStore;
pub use trust::{select_flow, DeviceId, Family, PufType, TrustFlow};

#[cfg(feature = "mock")]
pub use engine::mock::{MockDevice, MockEngine};
