//! Embedding vector normalization, byte codec and content fingerprinting.

use std::fmt::Write as _;

use crc32fast::Hasher;
use sha2::{Digest, Sha256};

const MAGIC: [u8; 4] = *b"VEC1";
const VERSION: u16 = 1;
const HEADER_BYTES: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt embedding: {0}")]
    CorruptEmbedding(&'static str),
}

/// L2-normalizes a vector. A zero vector is returned unchanged; callers must
/// not treat it as a valid identity signal.
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector;
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
    vector
}

/// Encodes a vector into a self-describing byte representation:
/// magic, version, dimensionality, CRC32 of the payload, then the
/// little-endian f32 payload.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    let mut hasher = Hasher::new();
    hasher.update(&payload);

    let mut out = Vec::with_capacity(HEADER_BYTES + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Decodes bytes produced by [`encode_embedding`]. Malformed or truncated
/// input fails with [`CodecError::CorruptEmbedding`]; it never degrades to a
/// zero or partial vector.
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() < HEADER_BYTES {
        return Err(CodecError::CorruptEmbedding("shorter than header"));
    }
    if bytes[0..4] != MAGIC {
        return Err(CodecError::CorruptEmbedding("bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(CodecError::CorruptEmbedding("unknown version"));
    }
    let dim = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let crc = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
    let payload = &bytes[HEADER_BYTES..];
    if payload.len() != dim * 4 {
        return Err(CodecError::CorruptEmbedding("payload length mismatch"));
    }
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(CodecError::CorruptEmbedding("checksum mismatch"));
    }
    let mut vector = Vec::with_capacity(dim);
    for chunk in payload.chunks_exact(4) {
        vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(vector)
}

/// Content fingerprint of a captured face crop, used only to reject
/// re-enrolling the exact same image for the same identity.
pub fn dedup_key(face_crop: &[u8]) -> String {
    let digest = Sha256::digest(face_crop);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
