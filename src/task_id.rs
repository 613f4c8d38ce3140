//! Task identifier generation.
//!
//! Root tasks get hash-derived identifiers (`bd-3fa9c1`) so uncoordinated
//! agents, possibly offline, can create tasks without a central counter.
//! Child tasks get deterministic dot-suffixed identifiers (`bd-3fa9c1.2`).
//!
//! Generation does not guarantee uniqueness by construction; the store checks
//! for collisions at insertion time and regenerates, treating more than
//! [`MAX_ID_ATTEMPTS`] consecutive collisions as an entropy failure.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of lowercase hex characters in a root id suffix.
pub const ID_SUFFIX_LEN: usize = 6;

/// Attempts before repeated collisions are treated as integrity-fatal.
pub const MAX_ID_ATTEMPTS: u32 = 6;

/// Generate a fresh root task identifier: `{prefix}-{6 hex chars}`.
///
/// The suffix hashes a high-resolution timestamp, 16 fresh random bytes and
/// the project identifier, so concurrent writers across machines stay
/// collision-resistant at the thousands-of-tasks scale.
pub fn new_task_id(prefix: &str, project_id: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(project_id.as_bytes());
    let digest = hasher.finalize();

    let mut suffix = String::with_capacity(ID_SUFFIX_LEN);
    for byte in digest.iter().take(ID_SUFFIX_LEN / 2) {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("{}-{}", prefix.trim(), suffix)
}

/// Deterministic child identifier: `{parent}.{n}` with `n >= 1`.
///
/// No randomness; the store picks the next unused `n` for a parent.
pub fn child_id(parent_id: &str, n: u32) -> String {
    debug_assert!(n >= 1, "child ordinals start at 1");
    format!("{parent_id}.{n}")
}
