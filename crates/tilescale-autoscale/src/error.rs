//! Autoscaler error types.

use thiserror::Error;

use tilescale_pool::PoolError;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// Negative or non-finite load figure. The sample was dropped.
    #[error("invalid sample: requests_per_replica = {value}")]
    InvalidSample { value: f64 },

    /// The pool refused or failed to apply a decision.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl AutoscaleError {
    /// Whether the same decision may succeed on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            AutoscaleError::InvalidSample { .. } => false,
            AutoscaleError::Pool(e) => e.is_retryable(),
        }
    }
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
