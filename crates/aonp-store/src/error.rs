//! Store error taxonomy

/// Failures surfaced by a [`crate::RunStore`] adapter.
///
/// Transient backend conditions (e.g. a busy database file) are retried
/// inside the adapter and only surface here once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint was violated (duplicate run id, duplicate
    /// per-run summary).
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The requested update would violate a lifecycle invariant.
    #[error("invalid transition: {reason}")]
    InvalidTransition { reason: String },

    /// The store location is not usable by this adapter.
    #[error("store location rejected: {reason}")]
    Rejected { reason: String },

    /// A stored document failed to deserialize.
    #[error("corrupt store document: {reason}")]
    Corrupt { reason: String },

    /// Backend failure after in-adapter retries were exhausted.
    #[error("store backend error: {0}")]
    Backend(#[from] rusqlite::Error),
}

impl StoreError {
    /// Shorthand for a not-found run.
    #[must_use]
    pub fn run_not_found(run_id: &str) -> Self {
        Self::NotFound { entity: "run", id: run_id.to_string() }
    }
}
