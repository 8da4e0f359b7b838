//! Balancer error types.

use thiserror::Error;

/// Errors that can occur while selecting an instance.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// Every registered instance is circuit-open, at capacity, or gone.
    /// Retryable — callers should surface this as a 503-equivalent.
    #[error("no healthy instance available")]
    NoHealthyInstance,
}

pub type BalanceResult<T> = Result<T, BalanceError>;
