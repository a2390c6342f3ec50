//! Canonical binary encoding
//!
//! Every record that is signed, hashed or sent over the wire goes through
//! this module so both sides agree on the exact bytes. Encoding is bincode
//! with fixed-width little-endian integers. Decoding rejects trailing bytes
//! and caps allocations at [`MAX_DECODE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

/// Upper bound on a single decoded record
pub const MAX_DECODE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode record: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode record: {0}")]
    Decode(bincode::Error),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_DECODE_SIZE)
        .reject_trailing_bytes()
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    options().serialize(value).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options().deserialize(bytes).map_err(CodecError::Decode)
}
