//! Error types for pool and orchestrator operations

use voice_backend::UpstreamError;

/// Errors surfaced by the pool and retry orchestrator.
///
/// Quota and transient upstream failures are recovered internally by
/// rotation and backoff; callers only ever see `PoolExhausted` (nothing
/// configured to try) or the final unwrapped upstream error after all
/// attempts are spent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no speech api keys available in the pool")]
    PoolExhausted,

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("key store error: {0}")]
    Store(#[from] voice_keys::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
