//! Stored descriptor encoding.
//!
//! Layout: a little-endian `u32` dimension followed by `dimension`
//! little-endian `f32` components. Nothing else, no padding.

use crate::types::Embedding;
use thiserror::Error;

const HEADER_LEN: usize = 4;
const COMPONENT_LEN: usize = 4;
/// Upper bound on a declared dimension, far above any face model's output.
const MAX_DIMENSION: usize = 8192;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("descriptor truncated: {0} bytes")]
    Truncated(usize),
    #[error("descriptor declares dimension {0}")]
    BadDimension(usize),
    #[error("descriptor length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("descriptor is not a valid embedding (non-finite or zero norm)")]
    Degenerate,
}

pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let values = embedding.values();
    let mut out = Vec::with_capacity(HEADER_LEN + values.len() * COMPONENT_LEN);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a stored descriptor, re-normalizing it to unit length.
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    let dim = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if dim == 0 || dim > MAX_DIMENSION {
        return Err(CodecError::BadDimension(dim));
    }

    let expected = HEADER_LEN + dim * COMPONENT_LEN;
    if bytes.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let values = body
        .chunks_exact(COMPONENT_LEN)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Embedding::from_raw(values).ok_or(CodecError::Degenerate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let e = Embedding::from_raw(vec![1.0, 0.0]).unwrap();
        let bytes = encode(&e);
        assert_eq!(bytes.len(), 4 + 2 * 4);
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0.0f32.to_le_bytes());
    }

    #[test]
    fn test_decode_preserves_values() {
        let e = Embedding::from_raw(vec![0.25, -0.5, 0.75, 0.1]).unwrap();
        let back = decode(&encode(&e)).unwrap();
        for (a, b) in e.values().iter().zip(back.values()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode(&[1, 0]), Err(CodecError::Truncated(2)));
        assert_eq!(decode(&[]), Err(CodecError::Truncated(0)));
    }

    #[test]
    fn test_decode_bad_dimension() {
        assert_eq!(decode(&0u32.to_le_bytes()), Err(CodecError::BadDimension(0)));
        assert_eq!(
            decode(&u32::MAX.to_le_bytes()),
            Err(CodecError::BadDimension(u32::MAX as usize))
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = encode(&Embedding::from_raw(vec![1.0, 2.0]).unwrap());
        bytes.pop();
        assert_eq!(
            decode(&bytes),
            Err(CodecError::LengthMismatch { expected: 12, actual: 11 })
        );
    }

    #[test]
    fn test_decode_zero_vector() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert_eq!(decode(&bytes), Err(CodecError::Degenerate));
    }

    #[test]
    fn test_decode_renormalizes() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&3.0f32.to_le_bytes());
        bytes.extend_from_slice(&4.0f32.to_le_bytes());
        let e = decode(&bytes).unwrap();
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
    }
}
