//! Replica pool error types.

use thiserror::Error;

/// Errors returned by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A target outside `[min, max]` reached the pool. Nothing was changed.
    #[error("target {requested} outside pool bounds [{min}, {max}]")]
    OutOfBounds { requested: u32, min: u32, max: u32 },

    /// The orchestration substrate did not accept a command. Retryable.
    #[error("orchestrator unreachable: {0}")]
    Unreachable(String),
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Unreachable(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
