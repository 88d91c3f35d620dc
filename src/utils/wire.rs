//! Canonical bincode options shared by every binary format in the crate.
//!
//! Decoding is size limited and rejects trailing bytes, so untrusted input
//! can neither force large allocations nor smuggle data past a record.
//! Single records are capped at [`crate::MAX_RECORD_SIZE`]; containers of
//! records pass their own limit.

use crate::utils::{CodecError, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .reject_trailing_bytes()
}

/// Encode `value`, naming it `what` in any error
pub(crate) fn encode<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    encode_bounded(what, value, crate::MAX_RECORD_SIZE)
}

/// Decode a `T` that must span all of `bytes`
pub(crate) fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    decode_bounded(what, bytes, crate::MAX_RECORD_SIZE)
}

/// [`encode`] with an explicit size limit
pub(crate) fn encode_bounded<T: Serialize>(what: &str, value: &T, limit: u64) -> Result<Vec<u8>> {
    options(limit)
        .serialize(value)
        .map_err(|e| CodecError::encoding(what, e).into())
}

/// [`decode`] with an explicit size limit
pub(crate) fn decode_bounded<T: DeserializeOwned>(what: &str, bytes: &[u8], limit: u64) -> Result<T> {
    options(limit)
        .deserialize(bytes)
        .map_err(|e| CodecError::decoding(what, e).into())
}
