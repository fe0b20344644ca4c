//! Trust-flow selection: which cached certificates assemble the authority
//! chain installed on the device.
//!
//! Selection is pure decision logic over the device identity, the
//! trust-anchor (PUF) type, the certificate SVN and an SKI/AKI equality
//! check; chain assembly then extracts the chosen files from the cached
//! bundle.

pub mod archive;

use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::error::TrustError;

/// Device-intrinsic trust-anchor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PufType {
    Efuse,
    Intel,
    Iid,
    IidUser,
}

impl std::fmt::Display for PufType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PufType::Efuse => "EFUSE",
            PufType::Intel => "INTEL",
            PufType::Iid => "IID",
            PufType::IidUser => "IID_USER",
        };
        f.write_str(name)
    }
}

/// Device family, derived from the JTAG ID-code response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Stratix10,
    Agilex,
    EasicN5x,
}

impl Family {
    pub fn from_id(family_id: u8) -> Option<Self> {
        match family_id {
            0x32 => Some(Family::Stratix10),
            0x34 => Some(Family::Agilex),
            0x35 => Some(Family::EasicN5x),
            _ => None,
        }
    }

    /// Lowercase name used in the cached bundle's file layout.
    pub fn family_name(&self) -> &'static str {
        match self {
            Family::Stratix10 => "s10",
            Family::Agilex => "agilex",
            Family::EasicN5x => "easic_n5x",
        }
    }

    /// Families whose firmware accepts authority provisioning.
    pub fn supports_set_authority(&self) -> bool {
        matches!(self, Family::Agilex | Family::EasicN5x)
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.family_name())
    }
}

/// Identity of one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    pub family: Family,
    pub uid: String,
}

impl DeviceId {
    pub fn new(family: Family, uid: impl Into<String>) -> Self {
        Self {
            family,
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.family, self.uid)
    }
}

/// Which authority chain gets installed. Selected once per onboarding
/// attempt and never reselected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustFlow {
    Iid,
    DeviceId,
    Enrollment,
}

const SVN_0: &str = "00";

/// Inputs to the flow selection.
pub struct FlowInputs<'a> {
    pub puf_type: PufType,
    /// Security version number from the device's enrollment certificate.
    pub svn: &'a str,
    pub force_enrollment: bool,
    /// Cached device-id certificate, if present in the bundle.
    pub device_id_cert: Option<&'a [u8]>,
    /// Enrollment certificate presented by the device.
    pub enrollment_cert: &'a X509,
    /// Cached IPCS enrollment certificate for this SVN, if present.
    pub ipcs_enrollment_cert: Option<&'a [u8]>,
}

pub(crate) fn parse_certificate(name: &str, der: &[u8]) -> Result<X509, TrustError> {
    X509::from_der(der)
        .or_else(|_| X509::from_pem(der))
        .map_err(|_| TrustError::CertificateParse(name.to_string()))
}

fn subject_key_identifier(cert: &X509) -> Option<Vec<u8>> {
    cert.subject_key_id().map(|ski| ski.as_slice().to_vec())
}

fn authority_key_identifier(cert: &X509) -> Option<Vec<u8>> {
    cert.authority_key_id().map(|aki| aki.as_slice().to_vec())
}

/// Select the trust flow for one onboarding attempt.
///
/// IID anchors always take the IID flow. Anchors with an online trust
/// authority take the enrollment flow when the SVN is non-zero or
/// enrollment is forced, and the device-id flow otherwise; in both cases a
/// failed key-identifier equality is a hard failure, never a fallback.
pub fn select_flow(inputs: &FlowInputs<'_>) -> Result<TrustFlow, TrustError> {
    match inputs.puf_type {
        PufType::Iid => Ok(TrustFlow::Iid),
        PufType::Intel | PufType::Efuse => {
            if inputs.svn != SVN_0 || inputs.force_enrollment {
                tracing::debug!("enrollment flow: check device certificate AKI against cached IPCS SKI");
                verify_enrollment_linkage(inputs)?;
                Ok(TrustFlow::Enrollment)
            } else {
                tracing::debug!("device-id flow: check device certificate SKI against cached device-id SKI");
                verify_device_id_linkage(inputs)?;
                Ok(TrustFlow::DeviceId)
            }
        }
        other => Err(TrustError::UnsupportedPufType(other)),
    }
}

/// Enrollment flow: the device certificate's Authority Key Identifier must
/// equal the cached IPCS enrollment certificate's Subject Key Identifier.
fn verify_enrollment_linkage(inputs: &FlowInputs<'_>) -> Result<(), TrustError> {
    let ipcs_der = inputs.ipcs_enrollment_cert.ok_or_else(|| {
        TrustError::TrustChainBroken("IPCS enrollment certificate for SVN is absent".to_string())
    })?;
    let ipcs_cert = parse_certificate("ipcs enrollment", ipcs_der)?;

    let device_aki = authority_key_identifier(inputs.enrollment_cert).ok_or_else(|| {
        TrustError::TrustChainBroken("device enrollment certificate is missing AKI".to_string())
    })?;
    let ipcs_ski = subject_key_identifier(&ipcs_cert).ok_or_else(|| {
        TrustError::TrustChainBroken("IPCS enrollment certificate is missing SKI".to_string())
    })?;

    tracing::debug!(
        device_aki = %hex::encode(&device_aki),
        ipcs_ski = %hex::encode(&ipcs_ski),
        "comparing key identifiers"
    );

    if device_aki != ipcs_ski {
        return Err(TrustError::TrustChainBroken(
            "device enrollment certificate AKI does not match IPCS enrollment certificate SKI"
                .to_string(),
        ));
    }
    Ok(())
}

/// Device-id flow: the device certificate's Subject Key Identifier must
/// equal the cached device-id certificate's Subject Key Identifier.
fn verify_device_id_linkage(inputs: &FlowInputs<'_>) -> Result<(), TrustError> {
    let device_id_der = inputs.device_id_cert.ok_or_else(|| {
        TrustError::TrustChainBroken("device-id certificate is absent from the bundle".to_string())
    })?;
    let device_id_cert = parse_certificate("device id", device_id_der)?;

    let cached_ski = subject_key_identifier(&device_id_cert).ok_or_else(|| {
        TrustError::TrustChainBroken("device-id certificate is missing SKI".to_string())
    })?;
    let device_ski = subject_key_identifier(inputs.enrollment_cert).ok_or_else(|| {
        TrustError::TrustChainBroken("device enrollment certificate is missing SKI".to_string())
    })?;

    tracing::debug!(
        device_ski = %hex::encode(&device_ski),
        cached_ski = %hex::encode(&cached_ski),
        "comparing key identifiers"
    );

    if device_ski != cached_ski {
        return Err(TrustError::TrustChainBroken(
            "device certificate SKI does not match device-id certificate SKI".to_string(),
        ));
    }
    Ok(())
}

/// Extract the security version number from the enrollment certificate's
/// issuer common name. DICE enrollment issuers carry colon-separated
/// parameters with the SVN as the fourth field, e.g.
/// `Intel:agilex:ER:01:0011223344556677`.
pub fn parse_svn(enrollment_cert: &X509) -> Result<String, TrustError> {
    let issuer_cn = enrollment_cert
        .issuer_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .ok_or_else(|| {
            TrustError::TrustChainBroken("enrollment certificate issuer has no CN".to_string())
        })?;

    let svn = issuer_cn
        .split(':')
        .nth(3)
        .filter(|svn| svn.len() == 2 && svn.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| {
            TrustError::TrustChainBroken(format!(
                "enrollment certificate issuer CN carries no SVN: {issuer_cn}"
            ))
        })?;

    Ok(svn.to_lowercase())
}
