//! Dispatcher — executes due jobs on a bounded worker pool.
//!
//! `dispatch` never blocks its caller: it spawns a task that first waits
//! for a worker permit, so concurrency is capped at `worker_concurrency`
//! while the scheduler's tick loop stays responsive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use dabby_registry::Registry;
use dabby_state::{JobId, JobRecord};

use crate::agent::{AgentError, AgentPool, AgentResponse};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of jobs executing concurrently.
    pub worker_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
        }
    }
}

/// Completion report for one dispatched job, consumed by the scheduler.
#[derive(Debug)]
pub struct Completion {
    pub job_id: JobId,
    pub result: Result<AgentResponse, AgentError>,
    pub latency: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Executes job payloads against the agent pool, bounded by a fixed-size
/// worker pool.
pub struct Dispatcher {
    pool: Arc<dyn AgentPool>,
    registry: Option<Arc<Registry>>,
    workers: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Dispatcher {
    /// Create a dispatcher and the completion stream the scheduler drains.
    pub fn new(
        pool: Arc<dyn AgentPool>,
        config: DispatcherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            pool,
            registry: None,
            workers: Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
            completions: tx,
        };
        (dispatcher, rx)
    }

    /// Feed per-instance request outcomes back into the registry.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Workers not currently executing a job.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Submit a job's payload for execution. Returns immediately; the
    /// outcome arrives on the completion stream.
    pub fn dispatch(&self, job: &JobRecord) {
        let pool = Arc::clone(&self.pool);
        let registry = self.registry.clone();
        let workers = Arc::clone(&self.workers);
        let completions = self.completions.clone();
        let job_id = job.id;
        let payload = job.payload.clone();

        tokio::spawn(async move {
            let permit = match workers.acquire_owned().await {
                Ok(p) => p,
                // Semaphore closed: the dispatcher is gone, drop the work.
                Err(_) => return,
            };

            let start = Instant::now();
            let result = pool.execute(payload).await;
            let latency = start.elapsed();
            drop(permit);

            let instance = match &result {
                Ok(resp) => resp.instance.clone(),
                Err(err) => err.instance.clone(),
            };
            if let (Some(registry), Some(instance)) = (&registry, &instance) {
                registry.record_outcome(instance, result.is_ok(), latency);
            }

            debug!(
                job_id,
                success = result.is_ok(),
                latency_ms = latency.as_millis() as u64,
                "job execution finished"
            );
            let _ = completions.send(Completion {
                job_id,
                result,
                latency,
                finished_at: Utc::now(),
            });
        });
    }
}
