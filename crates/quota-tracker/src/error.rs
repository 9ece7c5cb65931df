//! Error types for quota state persistence

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("state serialization error: {0}")]
    Serialize(String),
}

/// Result alias for quota tracker operations.
pub type Result<T> = std::result::Result<T, Error>;
