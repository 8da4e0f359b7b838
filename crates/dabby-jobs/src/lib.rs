//! dabby-jobs — background work scheduling and dispatch.
//!
//! The [`TaskScheduler`] accepts immediate, delayed, and periodic
//! (cron-scheduled) jobs and scans for due work from a single periodic
//! `tick`, so no job can be dispatched twice for one due instant. Due jobs
//! are handed to the [`Dispatcher`], which executes their payloads against
//! the external agent-pool capability on a semaphore-bounded worker pool
//! and reports completions back over a channel.
//!
//! Failures retry with exponential backoff up to `max_attempts`, then the
//! job is marked failed-final and reported on the scheduler's event
//! channel — never silently dropped. Backpressure is a hard cap on the
//! pending backlog: `submit` fails fast with `Saturated` instead of
//! growing unbounded.

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod scheduler;

pub use agent::{AgentError, AgentFuture, AgentPool, AgentResponse};
pub use dispatcher::{Completion, Dispatcher, DispatcherConfig};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{JobEvent, SchedulerConfig, SchedulerHandle, TaskScheduler};
