//! Content-addressed cache keys

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Derive a deterministic key from any serializable payload.
///
/// The payload goes through `serde_json::Value`, whose maps keep keys
/// sorted, then is hashed with SHA-256. Two payloads that differ only in
/// field order produce the same key.
pub fn create_cache_key<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let value = serde_json::to_value(payload)?;
    let bytes = serde_json::to_vec(&value)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
