//! Cached certificate-bundle access and authority-chain assembly.
//!
//! Bundles are device-specific zip archives prefetched by an external
//! collaborator; this module only reads them. The file layout inside a
//! bundle is fixed:
//!
//! ```text
//! auth/DICE_RootCA.cer
//! auth/IPCS_<family>.cer
//! <anchor>/deviceid.cer
//! <anchor>/enrollment_<svn>.cer
//! <anchor>/iiduds.cer        (IID anchors only)
//! ```
//!
//! where `<anchor>` is `puf` for INTEL anchors and `efuse` for EFUSE/IID.

use std::io::{Cursor, Read};

use async_trait::async_trait;
use openssl::x509::X509;
use zip::ZipArchive;

use crate::error::TrustError;

use super::{select_flow, DeviceId, FlowInputs, PufType, TrustFlow};

/// Read access to prefetched bundles, keyed by device identity.
///
/// Population and refresh of the cache are an external collaborator's
/// responsibility; this core treats it as read-only.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Fetch the cached bundle for a device. `Ok(None)` means no bundle
    /// has been prefetched.
    async fn find(&self, device: &DeviceId) -> Result<Option<Vec<u8>>, TrustError>;

    async fn is_prefetched(&self, device: &DeviceId) -> bool;
}

const DICE_ROOT_CA_CER: &str = "auth/DICE_RootCA.cer";

/// Resolved file paths inside a bundle for one `(pufType, svn, family)`
/// combination.
#[derive(Debug, Clone)]
pub struct ArchivePaths {
    puf_type: PufType,
    ipcs_family_cer: String,
    device_id_cer: String,
    enrollment_device_id_cer: String,
    efuse_iiduds_cer: String,
}

impl ArchivePaths {
    pub fn new(
        puf_type: PufType,
        svn: &str,
        family: super::Family,
    ) -> Result<Self, TrustError> {
        let anchor = anchor_dir(puf_type)?;
        Ok(Self {
            puf_type,
            ipcs_family_cer: format!("auth/IPCS_{}.cer", family.family_name()),
            device_id_cer: format!("{anchor}/deviceid.cer"),
            enrollment_device_id_cer: format!("{anchor}/enrollment_{svn}.cer"),
            efuse_iiduds_cer: format!("{anchor}/iiduds.cer"),
        })
    }

    pub fn dice_root_ca_cer(&self) -> &'static str {
        DICE_ROOT_CA_CER
    }

    pub fn ipcs_family_cer(&self) -> &str {
        &self.ipcs_family_cer
    }

    pub fn device_id_cer(&self) -> &str {
        &self.device_id_cer
    }

    pub fn enrollment_device_id_cer(&self) -> &str {
        &self.enrollment_device_id_cer
    }

    /// The IID-UDS certificate path. Requesting it for a non-IID anchor is
    /// a contract violation and fails fast.
    pub fn efuse_iiduds_cer(&self) -> Result<&str, TrustError> {
        match self.puf_type {
            PufType::Iid => Ok(&self.efuse_iiduds_cer),
            other => Err(TrustError::IidPathForNonIid(other)),
        }
    }
}

fn anchor_dir(puf_type: PufType) -> Result<&'static str, TrustError> {
    match puf_type {
        PufType::Intel => Ok("puf"),
        PufType::Efuse | PufType::Iid => Ok("efuse"),
        other => Err(TrustError::UnsupportedPufType(other)),
    }
}

fn open_archive(bundle: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, TrustError> {
    ZipArchive::new(Cursor::new(bundle)).map_err(|e| TrustError::ArchiveCorrupt(e.to_string()))
}

fn try_extract(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    path: &str,
) -> Result<Option<Vec<u8>>, TrustError> {
    match archive.by_name(path) {
        Ok(mut file) => {
            let mut content = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut content)
                .map_err(|e| TrustError::ArchiveCorrupt(e.to_string()))?;
            Ok(Some(content))
        }
        Err(zip::result::ZipError::FileNotFound) => {
            tracing::debug!(path, "file not found in bundle");
            Ok(None)
        }
        Err(e) => Err(TrustError::ArchiveCorrupt(e.to_string())),
    }
}

fn extract(archive: &mut ZipArchive<Cursor<&[u8]>>, path: &str) -> Result<Vec<u8>, TrustError> {
    try_extract(archive, path)?.ok_or_else(|| TrustError::RequiredFileMissing(path.to_string()))
}

/// The selected flow and the ordered (root-first) chain extracted for it.
#[derive(Debug, Clone)]
pub struct AssembledChain {
    pub flow: TrustFlow,
    pub certificates: Vec<Vec<u8>>,
}

/// Assemble the authority chain from a cached bundle.
///
/// Always starts with the DICE root CA and the family IPCS certificate,
/// then appends the flow-specific tail: the IID-UDS certificate, the IPCS
/// enrollment certificate plus the device-presented enrollment certificate,
/// or the cached device-id certificate.
pub fn assemble_chain(
    bundle: &[u8],
    device: &DeviceId,
    puf_type: PufType,
    svn: &str,
    enrollment_cert: &X509,
    force_enrollment: bool,
) -> Result<AssembledChain, TrustError> {
    let mut archive = open_archive(bundle)?;
    tracing::debug!(
        device = %device,
        files = ?archive.file_names().collect::<Vec<_>>(),
        "bundle content listing"
    );

    let paths = ArchivePaths::new(puf_type, svn, device.family)?;

    let mut certificates = vec![
        extract(&mut archive, paths.dice_root_ca_cer())?,
        extract(&mut archive, paths.ipcs_family_cer())?,
    ];

    let device_id_cert = try_extract(&mut archive, paths.device_id_cer())?;
    let ipcs_enrollment_cert = try_extract(&mut archive, paths.enrollment_device_id_cer())?;

    let flow = select_flow(&FlowInputs {
        puf_type,
        svn,
        force_enrollment,
        device_id_cert: device_id_cert.as_deref(),
        enrollment_cert,
        ipcs_enrollment_cert: ipcs_enrollment_cert.as_deref(),
    })?;
    tracing::debug!(?flow, "performing trust flow");

    match flow {
        TrustFlow::Iid => {
            certificates.push(extract(&mut archive, paths.efuse_iiduds_cer()?)?);
        }
        TrustFlow::Enrollment => {
            let ipcs = ipcs_enrollment_cert.ok_or_else(|| {
                TrustError::RequiredFileMissing(paths.enrollment_device_id_cer().to_string())
            })?;
            certificates.push(ipcs);
            certificates.push(
                enrollment_cert
                    .to_der()
                    .map_err(|_| TrustError::CertificateParse("device enrollment".to_string()))?,
            );
        }
        TrustFlow::DeviceId => {
            let cached = device_id_cert.ok_or_else(|| {
                TrustError::RequiredFileMissing(paths.device_id_cer().to_string())
            })?;
            certificates.push(cached);
        }
    }

    Ok(AssembledChain { flow, certificates })
}
