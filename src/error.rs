//! Error taxonomy for the service layer
//!
//! Model code and backends propagate `anyhow::Error`; everything that crosses
//! the service boundary (executors, HTTP handlers) speaks [`LensError`] so the
//! caller can tell a bad request apart from a failed worker.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum LensError {
    /// Unknown model name
    #[error("model not found: {0}")]
    NotFound(String),

    /// Request is well-formed JSON but semantically invalid
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Device memory exhausted even at the smallest batch size
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Remote worker returned an error or could not be reached
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Remote worker did not answer within the configured bound
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Anything raised by the model layer
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LensError {
    /// Shorthand for [`LensError::InvalidRequest`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether the caller is at fault (4xx family)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidRequest(_))
    }
}

impl From<candle_core::Error> for LensError {
    fn from(err: candle_core::Error) -> Self {
        Self::Internal(err.into())
    }
}

/// Result alias for service-level operations
pub type LensResult<T> = std::result::Result<T, LensError>;

/// Check whether an error chain reports device memory exhaustion.
///
/// candle surfaces CUDA/Metal allocation failures as opaque backend errors,
/// so this matches on the rendered message.
pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("out of memory") || msg.contains("out_of_memory")
}
