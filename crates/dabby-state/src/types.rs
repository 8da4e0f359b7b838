//! Domain types shared across the dabby core.
//!
//! These types describe backend instances and scheduled jobs. Everything
//! here is serializable to/from JSON for storage in redb tables; the
//! registry keeps its own live (non-persisted) counters on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a backend instance.
pub type InstanceId = String;

/// Unique identifier for a scheduled job. Assigned once at submit,
/// monotonically increasing within a scheduler.
pub type JobId = u64;

// ── Instances ─────────────────────────────────────────────────────

/// Immutable identity of one backend instance. Created at configuration
/// load, never mutated, replaced wholesale on reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub id: InstanceId,
    /// Listen address (ip:port) the instance serves on.
    pub address: String,
    /// Relative weight for weighted strategies (>= 1).
    pub weight: u32,
    /// Upper bound on concurrent requests routed to this instance.
    pub max_connections: u32,
}

impl InstanceDescriptor {
    pub fn new(id: impl Into<InstanceId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            max_connections: 10,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Health state as seen by the load balancer.
///
/// `Suspect` is the half-open circuit state: exactly one trial request may
/// be routed through while the instance re-proves itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Suspect,
    Unhealthy,
}

/// Persisted snapshot of one instance's health tracking state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceHealthRecord {
    pub id: InstanceId,
    pub health: HealthState,
    pub consecutive_failures: u32,
    /// Smoothed response time in milliseconds, if any outcome was recorded.
    pub last_response_time_ms: Option<f64>,
    /// How many times the circuit re-opened without a full recovery.
    pub reopen_count: u32,
    /// Unix timestamp of last change.
    pub updated_at: u64,
}

// ── Jobs ──────────────────────────────────────────────────────────

/// When a job should run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Run as soon as the next tick observes it.
    Immediate,
    /// Run at (or as soon after as the tick resolution allows) a fixed time.
    DelayedAt { at: DateTime<Utc> },
    /// Run on a cron schedule (`sec min hour dom mon dow [year]`),
    /// rescheduling after every successful run until cancelled.
    Periodic { schedule: String },
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One scheduled unit of work. The payload is opaque to the scheduler and
/// handed verbatim to the agent pool at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Next due time. For Pending jobs this is when the tick loop picks
    /// them up; meaningless once terminal.
    pub next_run_at: DateTime<Utc>,
    /// Message from the most recent failed attempt, kept for inspection.
    pub last_error: Option<String>,
    /// Set by `cancel` while the job is running; prevents any reschedule.
    pub cancel_requested: bool,
    /// Unix timestamp (seconds) when the job was submitted.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl JobRecord {
    /// Build the key for the jobs table. Zero-padded so redb iteration
    /// order equals id order.
    pub fn table_key(&self) -> String {
        job_table_key(self.id)
    }
}

/// Zero-padded jobs-table key for a job id.
pub fn job_table_key(id: JobId) -> String {
    format!("{id:020}")
}
