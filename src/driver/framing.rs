//! Binary framings for certificate chains exchanged with the device.
//!
//! Two distinct encodings exist: the local-chain image pushed into the
//! engine before connecting (length/hash-prefixed ASN.1 wrapper), and the
//! SET_CERTIFICATE image installed into a device slot (word-padded
//! length/root-hash-prefixed concatenation).

use sha2::{Digest, Sha384};

use crate::engine::SHA384_LEN;
use crate::error::ProtocolError;

const WORD_SIZE: usize = 4;
const SET_CERT_RESERVED_LEN: usize = 2;

/// Encode a DER length (short form below 128, long form above).
fn der_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn der_read_len(data: &[u8]) -> Option<(usize, usize)> {
    let first = *data.first()?;
    if first < 0x80 {
        return Some((first as usize, 1));
    }
    let count = (first & 0x7F) as usize;
    if count == 0 || count > std::mem::size_of::<usize>() || data.len() < 1 + count {
        return None;
    }
    let mut len = 0usize;
    for &b in &data[1..1 + count] {
        len = (len << 8) | b as usize;
    }
    Some((len, 1 + count))
}

/// `SEQUENCE(OCTET STRING(chain))` wrapper around the raw chain bytes.
fn der_sequence_of_octet_string(chain: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(chain.len() + 8);
    inner.push(0x04);
    der_len(chain.len(), &mut inner);
    inner.extend_from_slice(chain);

    let mut outer = Vec::with_capacity(inner.len() + 8);
    outer.push(0x30);
    der_len(inner.len(), &mut outer);
    outer.extend_from_slice(&inner);
    outer
}

/// Frame a local certificate chain for provisioning into the engine:
/// `length:u32-LE | SHA-384(sequence) | sequence` where `sequence` is
/// `SEQUENCE(OCTET STRING(chain))` and `length` covers all three parts.
pub fn encode_local_chain(chain: &[u8]) -> Vec<u8> {
    let sequence = der_sequence_of_octet_string(chain);
    let hash = Sha384::digest(&sequence);

    let length = std::mem::size_of::<u32>() + hash.len() + sequence.len();
    let mut framed = Vec::with_capacity(length);
    framed.extend_from_slice(&(length as u32).to_le_bytes());
    framed.extend_from_slice(&hash);
    framed.extend_from_slice(&sequence);
    framed
}

/// Recover the raw chain bytes from a framed local chain, re-verifying the
/// embedded digest.
pub fn decode_local_chain(framed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let malformed = || ProtocolError::InternalException;

    if framed.len() < 4 + SHA384_LEN {
        return Err(malformed());
    }
    let length = u32::from_le_bytes(framed[..4].try_into().unwrap()) as usize;
    if length != framed.len() {
        return Err(malformed());
    }

    let hash = &framed[4..4 + SHA384_LEN];
    let sequence = &framed[4 + SHA384_LEN..];
    if Sha384::digest(sequence).as_slice() != hash {
        return Err(malformed());
    }

    let rest = sequence.strip_prefix(&[0x30]).ok_or_else(malformed)?;
    let (seq_len, consumed) = der_read_len(rest).ok_or_else(malformed)?;
    let inner = rest.get(consumed..consumed + seq_len).ok_or_else(malformed)?;

    let rest = inner.strip_prefix(&[0x04]).ok_or_else(malformed)?;
    let (chain_len, consumed) = der_read_len(rest).ok_or_else(malformed)?;
    let chain = rest.get(consumed..consumed + chain_len).ok_or_else(malformed)?;
    Ok(chain.to_vec())
}

/// SET_CERTIFICATE chain image:
/// `len:u16-LE | reserved[2] | SHA-384(root cert) | cert₁‖cert₂‖…`,
/// zero-padded to a word boundary. `len` counts everything before padding.
#[derive(Debug, Clone)]
pub struct SetCertificateImage {
    image: Vec<u8>,
    chain_len: u16,
}

impl SetCertificateImage {
    pub fn build(certificate_chain: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        let root = certificate_chain
            .first()
            .ok_or(ProtocolError::EmptyCertificateChain)?;
        let root_hash = Sha384::digest(root);
        tracing::debug!(root_hash = %hex::encode(root_hash), "computed root certificate hash");

        let certs_len: usize = certificate_chain.iter().map(Vec::len).sum();
        let chain_len = SET_CERT_RESERVED_LEN + std::mem::size_of::<u16>() + root_hash.len() + certs_len;
        let padded_len = chain_len.div_ceil(WORD_SIZE) * WORD_SIZE;

        let mut image = Vec::with_capacity(padded_len);
        image.extend_from_slice(&(chain_len as u16).to_le_bytes());
        image.extend_from_slice(&[0u8; SET_CERT_RESERVED_LEN]);
        image.extend_from_slice(&root_hash);
        for cert in certificate_chain {
            image.extend_from_slice(cert);
        }
        image.resize(padded_len, 0);

        Ok(Self {
            image,
            chain_len: chain_len as u16,
        })
    }

    /// Padded image bytes handed to the engine.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Unpadded chain length the engine is told about.
    pub fn chain_len(&self) -> usize {
        self.chain_len as usize
    }
}
