//! Content fingerprinting for change detection.
//!
//! The external diff engine compares fingerprints instead of diffing every
//! field on every write, so the digest must be a pure, order-independent
//! function of field contents. Cryptographic strength is not required.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint a record's field map.
///
/// Keys are serialized in sorted order (`BTreeMap` iteration order) with a
/// separator that cannot appear ambiguously, so equal maps always produce
/// equal digests regardless of how they were built up.
pub fn fingerprint_fields(fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}
