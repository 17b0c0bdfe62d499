// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON and digest helpers.
//!
//! Every digest in the control plane (scenario step digests, policy target
//! hashes, sidecar comparison) goes through [`canonical_json`]: keys sorted,
//! no insignificant whitespace, integers kept as integers. `serde_json`'s
//! `Number` cannot represent NaN or infinities, so non-finite floats are
//! structurally excluded from the canonical form.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors from canonicalization.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The value could not be serialized to JSON.
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize `value` to canonical JSON.
///
/// `serde_json`'s default map representation is a `BTreeMap`, so object keys
/// come out sorted; compact formatting drops insignificant whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Hex-encoded SHA-256 of the canonical JSON form of `value`.
pub fn canonical_sha256<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
