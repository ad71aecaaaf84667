//! Content addressing.
//!
//! Every job and result is identified by the SHA-256 of its canonical
//! JSON form. `serde_json` object maps keep keys sorted, so two peers
//! serializing the same structure always produce the same bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hex-encoded SHA-256 digest of the canonical JSON encoding of `value`.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    // Round-trip through Value so struct field order does not leak into the digest.
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
