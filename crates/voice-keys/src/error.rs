//! Error types for key store operations

/// Errors from key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key store I/O error: {0}")]
    Io(String),

    #[error("key record parse error: {0}")]
    Parse(String),
}

/// Result alias for key store operations.
pub type Result<T> = std::result::Result<T, Error>;
