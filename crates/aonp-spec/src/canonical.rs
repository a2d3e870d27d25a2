//! Canonical serialization and content hashing
//!
//! The canonical form is JCS (RFC 8785) over the spec's JSON value: object
//! keys sorted lexicographically at every depth, `,`/`:` separators with no
//! insignificant whitespace, shortest round-trip number rendering, minimal
//! string escaping. Ordered sequences (nuclide lists) are JSON arrays and
//! keep author order; set-like collections (the materials map) sort by key.
//!
//! [`SpecHash`] is the lowercase hex SHA-256 of those bytes. It is the
//! identity of a study: stable across formatting, comments, and key
//! reordering, and sensitive to every validated value.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::StudySpec;

/// Content hash of a study's canonical bytes.
///
/// Always 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Wrap an already-computed hash string.
    ///
    /// Intended for rehydrating store records; does not re-verify the
    /// digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex digest as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Emit the canonical byte sequence for a spec.
///
/// This is what gets hashed and what lands on disk as `study_spec.json`,
/// byte for byte.
///
/// # Panics
///
/// Never panics for a [`StudySpec`] produced by this crate's parsers: the
/// model contains no map keys that are not strings and no non-finite
/// floats (validation rejects them), which are the only inputs JCS can
/// refuse.
#[must_use]
pub fn canonical_bytes(spec: &StudySpec) -> Vec<u8> {
    let value = serde_json::to_value(spec).expect("StudySpec serializes to a JSON value");
    serde_json_canonicalizer::to_vec(&value).expect("validated spec values are JCS-representable")
}

/// Compute the content hash of a spec.
#[must_use]
pub fn spec_hash(spec: &StudySpec) -> SpecHash {
    let digest = Sha256::digest(canonical_bytes(spec));
    SpecHash(format!("{digest:x}"))
}
