//! The opaque context a stateless caller echoes back on every round trip.
//!
//! Server-side session state is forbidden: everything a later stage needs
//! is serialized, sealed and handed to the caller, who must return it
//! unmodified on the next call. A new sealed value is produced on every
//! response; the context is never mutated in place.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::OnboardingError;
use crate::trust::{DeviceId, PufType};

/// Logical content of the sealed context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingContext {
    pub puf_type: PufType,
    pub slot_id: u8,
    pub force_enrollment: bool,
    /// Service-configuration identifier, when the caller operates under a
    /// named configuration.
    pub config_id: Option<u64>,
    /// Resolved once the device has identified itself.
    pub device: Option<DeviceId>,
    /// Security version number from the device's enrollment certificate.
    pub svn: Option<String>,
}

impl OnboardingContext {
    pub fn new(puf_type: PufType, slot_id: u8, force_enrollment: bool) -> Self {
        Self {
            puf_type,
            slot_id,
            force_enrollment,
            config_id: None,
            device: None,
            svn: None,
        }
    }
}

/// Seal/open capability for the opaque context blob.
///
/// Supplied by the embedding service; the handler chain treats it as a
/// black box. Failures on open surface as a generic protocol failure and
/// never silently default the context.
pub trait ContextSealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, OnboardingError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, OnboardingError>;
}

/// Serialize and seal a context.
pub fn seal_context(
    sealer: &dyn ContextSealer,
    context: &OnboardingContext,
) -> Result<Vec<u8>, OnboardingError> {
    let mut body = Vec::new();
    ciborium::into_writer(context, &mut body).map_err(|_| OnboardingError::ContextSealFailed)?;
    sealer.seal(&body)
}

/// Open and deserialize a context.
pub fn open_context(
    sealer: &dyn ContextSealer,
    sealed: &[u8],
) -> Result<OnboardingContext, OnboardingError> {
    let body = sealer
        .open(sealed)
        .map_err(|_| OnboardingError::ContextOpenFailed)?;
    ciborium::from_reader(body.as_slice()).map_err(|_| OnboardingError::ContextOpenFailed)
}

const NONCE_LEN: usize = 12;

/// Reference [`ContextSealer`]: ChaCha20-Poly1305 with a random nonce
/// prepended to the ciphertext. Each seal of the same context produces a
/// distinct blob.
pub struct ChaChaContextSealer {
    cipher: ChaCha20Poly1305,
}

impl ChaChaContextSealer {
    pub fn new(mut key: [u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("key length is 32");
        key.zeroize();
        Self { cipher }
    }
}

impl Drop for ChaChaContextSealer {
    fn drop(&mut self) {
        // ChaCha20Poly1305 does not impl Zeroize. Use volatile writes to
        // clear the cipher struct (which contains the key) on drop.
        unsafe {
            let ptr = &mut self.cipher as *mut ChaCha20Poly1305 as *mut u8;
            let size = core::mem::size_of::<ChaCha20Poly1305>();
            core::ptr::write_bytes(ptr, 0, size);
            core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

impl ContextSealer for ChaChaContextSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, OnboardingError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| OnboardingError::ContextSealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, OnboardingError> {
        if sealed.len() < NONCE_LEN {
            return Err(OnboardingError::ContextOpenFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| OnboardingError::ContextOpenFailed)
    }
}
