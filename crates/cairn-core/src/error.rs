use thiserror::Error;

/// Top-level error type for the Cairn store.
///
/// Lower layers return `Ok(None)` / empty collections for expected-missing
/// data; these variants cover the cases that must fail loudly.
#[derive(Debug, Error)]
pub enum CairnError {
    /// A session (or a record that requires one) does not exist.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Persisted content exists but cannot be parsed. Distinct from
    /// [`CairnError::NotFound`] so partial-write corruption is visible to
    /// callers instead of masquerading as an absent session.
    #[error("Corrupt data for session {thread_id}: {detail}")]
    Corrupt {
        /// The session whose data failed to parse.
        thread_id: String,
        /// What failed to parse and why.
        detail: String,
    },

    /// A record was structurally rejected before persistence.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error other than "file not found".
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CairnError`].
pub type CairnResult<T> = Result<T, CairnError>;
