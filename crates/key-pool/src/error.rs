//! Error types for pool construction

/// Errors from building a credential pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider {0} has no usable credentials")]
    Empty(String),

    #[error("credential {credential} belongs to {actual}, not {expected}")]
    ProviderMismatch {
        credential: String,
        expected: String,
        actual: String,
    },

    #[error("credential {0} listed more than once")]
    Duplicate(String),

    #[error("invalid pool ordering: {0}")]
    Ordering(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
