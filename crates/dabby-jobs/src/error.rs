//! Scheduler error types.

use thiserror::Error;

/// Errors surfaced by the task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pending backlog is at its configured limit. Callers should back
    /// off and resubmit later.
    #[error("scheduler saturated: {backlog} jobs pending")]
    Saturated { backlog: usize },

    /// A periodic job's cron expression could not be parsed, or yields no
    /// future instant.
    #[error("invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("state store error: {0}")]
    State(#[from] dabby_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
