//! Task scheduler — job lifecycle and due-time scanning.
//!
//! All due-job evaluation happens in `tick`, driven by a single background
//! task, so a job can never be dispatched twice for one due instant.
//! Completions come back from the dispatcher over a channel and are applied
//! by the same loop, serializing every job mutation.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dabby_state::{JobId, JobKind, JobRecord, JobStatus, StateStore};

use crate::dispatcher::{Completion, Dispatcher};
use crate::error::{SchedulerError, SchedulerResult};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Resolution of the due-job scan.
    pub tick_interval: Duration,
    /// Attempts before a job is marked failed-final.
    pub max_job_attempts: u32,
    /// Hard cap on the Pending backlog; `submit` fails fast beyond it.
    pub backlog_limit: usize,
    /// Retry delay after the first failed attempt.
    pub retry_base_backoff: Duration,
    /// Retry delay ceiling.
    pub retry_max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_job_attempts: 3,
            backlog_limit: 256,
            retry_base_backoff: Duration::from_secs(1),
            retry_max_backoff: Duration::from_secs(60),
        }
    }
}

/// Job lifecycle events, reported upward so terminal failures are never
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Dispatched {
        id: JobId,
    },
    Succeeded {
        id: JobId,
    },
    Retrying {
        id: JobId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    FailedFinal {
        id: JobId,
        attempts: u32,
        error: String,
    },
    Cancelled {
        id: JobId,
    },
}

/// In-memory job entry: the record plus its parsed cron schedule.
struct JobEntry {
    record: JobRecord,
    schedule: Option<Schedule>,
}

/// Handle to the running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Accepts immediate, delayed, and periodic jobs and hands due work to the
/// dispatcher. Sole owner of the job lifecycle.
pub struct TaskScheduler {
    config: SchedulerConfig,
    dispatcher: Dispatcher,
    store: Option<StateStore>,
    /// Jobs keyed by id; BTreeMap iteration gives the ascending-id
    /// dispatch order for same-instant due jobs.
    jobs: Mutex<BTreeMap<JobId, JobEntry>>,
    next_id: AtomicU64,
    listeners: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher,
            store: None,
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Persist job state to the given store on every transition.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn emit(&self, event: JobEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Reload persisted jobs from the store.
    ///
    /// Jobs found `Running` (in flight when a previous process died) return
    /// to `Pending` due immediately — delivery is at-least-once. Returns
    /// the number of such recovered jobs.
    pub fn recover(&self, now: DateTime<Utc>) -> SchedulerResult<u32> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let recovered = store.recover_running_jobs(now)?;
        let mut max_id = 0;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for record in store.list_jobs()? {
            max_id = max_id.max(record.id);
            let schedule = match &record.kind {
                JobKind::Periodic { schedule } => match Schedule::from_str(schedule) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        error!(job_id = record.id, error = %e, "stored schedule unparseable, job skipped");
                        continue;
                    }
                },
                _ => None,
            };
            jobs.insert(record.id, JobEntry { record, schedule });
        }
        drop(jobs);

        if max_id >= self.next_id.load(Ordering::SeqCst) {
            self.next_id.store(max_id + 1, Ordering::SeqCst);
        }
        if recovered > 0 {
            info!(recovered, "in-flight jobs returned to pending");
        }
        Ok(recovered)
    }

    /// Submit a job. Immediate jobs are due at once; periodic jobs are due
    /// at their first schedule instant.
    ///
    /// Fails fast with `Saturated` when the Pending backlog is at its
    /// limit, and with `InvalidSchedule` for a bad cron expression.
    pub fn submit(&self, kind: JobKind, payload: serde_json::Value) -> SchedulerResult<JobId> {
        let now = Utc::now();

        let backlog = self.backlog();
        if backlog >= self.config.backlog_limit {
            warn!(backlog, limit = self.config.backlog_limit, "submit rejected, backlog full");
            return Err(SchedulerError::Saturated { backlog });
        }

        let (schedule, next_run_at) = match &kind {
            JobKind::Immediate => (None, now),
            JobKind::DelayedAt { at } => (None, *at),
            JobKind::Periodic { schedule } => {
                let parsed = Schedule::from_str(schedule)
                    .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
                let first = parsed.after(&now).next().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("schedule `{schedule}` has no future instant"))
                })?;
                (Some(parsed), first)
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = JobRecord {
            id,
            kind,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_job_attempts,
            next_run_at,
            last_error: None,
            cancel_requested: false,
            created_at: now.timestamp() as u64,
            updated_at: now.timestamp() as u64,
        };

        if let Some(store) = &self.store {
            store.put_job(&record)?;
        }
        info!(job_id = id, kind = ?record.kind, due = %next_run_at, "job submitted");
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, JobEntry { record, schedule });
        Ok(id)
    }

    /// Cancel a job. Idempotent: unknown ids and already-terminal jobs are
    /// no-ops. A `Running` job finishes its current execution and is then
    /// marked `Cancelled` without rescheduling.
    pub fn cancel(&self, id: JobId) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = jobs.get_mut(&id) else {
            debug!(job_id = id, "cancel for unknown job ignored");
            return;
        };

        match entry.record.status {
            JobStatus::Pending => {
                entry.record.status = JobStatus::Cancelled;
                entry.record.updated_at = Utc::now().timestamp() as u64;
                self.persist(&entry.record);
                info!(job_id = id, "job cancelled");
                self.emit(JobEvent::Cancelled { id });
            }
            JobStatus::Running => {
                entry.record.cancel_requested = true;
                self.persist(&entry.record);
                info!(job_id = id, "cancellation requested for running job");
            }
            // Terminal: nothing to do.
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {}
        }
    }

    /// Scan Pending jobs due at or before `now` and hand them to the
    /// dispatcher, in ascending id order. Returns the dispatched ids.
    ///
    /// The only mutating entry point on the due path; callers drive it from
    /// exactly one periodic loop.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let due: Vec<JobRecord> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.values_mut()
                .filter(|e| e.record.status == JobStatus::Pending && e.record.next_run_at <= now)
                .map(|e| {
                    e.record.status = JobStatus::Running;
                    e.record.updated_at = now.timestamp() as u64;
                    e.record.clone()
                })
                .collect()
        };

        let mut ids = Vec::with_capacity(due.len());
        for record in &due {
            self.persist(record);
            debug!(job_id = record.id, "job dispatched");
            self.dispatcher.dispatch(record);
            self.emit(JobEvent::Dispatched { id: record.id });
            ids.push(record.id);
        }
        ids
    }

    /// Apply one completion from the dispatcher.
    ///
    /// Success makes the job `Succeeded` (or re-`Pending` for periodic
    /// jobs); failure retries with exponential backoff until the attempt
    /// budget is spent, then marks it `Failed` and reports the loss.
    pub fn apply_completion(&self, completion: Completion) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = jobs.get_mut(&completion.job_id) else {
            warn!(job_id = completion.job_id, "completion for unknown job dropped");
            return;
        };
        if entry.record.status != JobStatus::Running {
            warn!(
                job_id = completion.job_id,
                status = ?entry.record.status,
                "completion for non-running job dropped"
            );
            return;
        }

        let id = entry.record.id;
        let finished_at = completion.finished_at;
        entry.record.updated_at = finished_at.timestamp() as u64;

        match completion.result {
            Ok(_) => {
                entry.record.attempts = 0;
                entry.record.last_error = None;

                if entry.record.cancel_requested {
                    entry.record.status = JobStatus::Cancelled;
                    info!(job_id = id, "job cancelled after final execution");
                    self.emit(JobEvent::Cancelled { id });
                } else if let Some(next) = entry
                    .schedule
                    .as_ref()
                    .and_then(|s| s.after(&finished_at).next())
                {
                    // Periodic: recompute from the completed run, so a
                    // backlog of missed instants collapses into one run and
                    // the schedule resumes from now.
                    entry.record.status = JobStatus::Pending;
                    entry.record.next_run_at = next;
                    debug!(job_id = id, next_run = %next, "periodic job rescheduled");
                    self.emit(JobEvent::Succeeded { id });
                } else {
                    entry.record.status = JobStatus::Succeeded;
                    info!(job_id = id, "job succeeded");
                    self.emit(JobEvent::Succeeded { id });
                }
            }
            Err(err) => {
                entry.record.attempts += 1;
                entry.record.last_error = Some(err.message.clone());

                if entry.record.cancel_requested {
                    entry.record.status = JobStatus::Cancelled;
                    info!(job_id = id, "job cancelled after failed execution");
                    self.emit(JobEvent::Cancelled { id });
                } else if entry.record.attempts < entry.record.max_attempts {
                    let backoff = retry_backoff(
                        self.config.retry_base_backoff,
                        self.config.retry_max_backoff,
                        entry.record.attempts,
                    );
                    let delta = chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    entry.record.status = JobStatus::Pending;
                    entry.record.next_run_at = finished_at + delta;
                    warn!(
                        job_id = id,
                        attempts = entry.record.attempts,
                        retry_at = %entry.record.next_run_at,
                        error = %err.message,
                        "job failed, retrying"
                    );
                    self.emit(JobEvent::Retrying {
                        id,
                        attempts: entry.record.attempts,
                        next_run_at: entry.record.next_run_at,
                    });
                } else {
                    entry.record.status = JobStatus::Failed;
                    error!(
                        job_id = id,
                        attempts = entry.record.attempts,
                        error = %err.message,
                        "job failed permanently"
                    );
                    self.emit(JobEvent::FailedFinal {
                        id,
                        attempts: entry.record.attempts,
                        error: err.message,
                    });
                }
            }
        }

        let record = entry.record.clone();
        drop(jobs);
        self.persist(&record);
    }

    /// Move a Pending job to a new due time. Returns false for running or
    /// terminal jobs (and unknown ids).
    pub fn reschedule(&self, id: JobId, at: DateTime<Utc>) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if entry.record.status != JobStatus::Pending {
            return false;
        }

        entry.record.next_run_at = at;
        if matches!(entry.record.kind, JobKind::DelayedAt { .. }) {
            entry.record.kind = JobKind::DelayedAt { at };
        }
        entry.record.updated_at = Utc::now().timestamp() as u64;
        self.persist(&entry.record);
        info!(job_id = id, due = %at, "job rescheduled");
        true
    }

    /// Look up one job's current record.
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|e| e.record.clone())
    }

    /// All job records in ascending id order.
    pub fn jobs_snapshot(&self) -> Vec<JobRecord> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Number of Pending jobs awaiting dispatch.
    pub fn backlog(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.record.status == JobStatus::Pending)
            .count()
    }

    fn persist(&self, record: &JobRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_job(record) {
                error!(job_id = record.id, error = %e, "failed to persist job");
            }
        }
    }

    /// Spawn the scheduler loop: periodic due-scan plus completion drain.
    /// Cancellation is cooperative, checked each iteration.
    pub fn start(
        self: Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.config.tick_interval, "task scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Utc::now());
                    }
                    completion = completions.recv() => {
                        match completion {
                            Some(c) => self.apply_completion(c),
                            // Dispatcher gone; nothing more will complete.
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("task scheduler shutting down");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Exponential retry delay: `base * 2^(attempts-1)`, capped.
fn retry_backoff(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentFuture, AgentPool, AgentResponse};
    use crate::dispatcher::DispatcherConfig;
    use chrono::TimeZone;

    /// Pool whose futures never resolve — tests drive completions by hand.
    struct PendingPool;

    impl AgentPool for PendingPool {
        fn execute(&self, _payload: serde_json::Value) -> AgentFuture {
            Box::pin(std::future::pending())
        }
    }

    /// Pool that succeeds immediately.
    struct OkPool;

    impl AgentPool for OkPool {
        fn execute(&self, payload: serde_json::Value) -> AgentFuture {
            Box::pin(async move {
                Ok(AgentResponse {
                    instance: None,
                    body: payload,
                })
            })
        }
    }

    fn scheduler_with(config: SchedulerConfig) -> TaskScheduler {
        let (dispatcher, _completions) =
            Dispatcher::new(Arc::new(PendingPool), DispatcherConfig::default());
        TaskScheduler::new(config, dispatcher)
    }

    fn scheduler() -> TaskScheduler {
        scheduler_with(SchedulerConfig::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn ok_completion(job_id: JobId, finished_at: DateTime<Utc>) -> Completion {
        Completion {
            job_id,
            result: Ok(AgentResponse {
                instance: None,
                body: serde_json::Value::Null,
            }),
            latency: Duration::from_millis(10),
            finished_at,
        }
    }

    fn err_completion(job_id: JobId, finished_at: DateTime<Utc>) -> Completion {
        Completion {
            job_id,
            result: Err(AgentError::new("llm backend unavailable")),
            latency: Duration::from_millis(10),
            finished_at,
        }
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"task": "audit_report"})
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn submit_assigns_ascending_ids() {
        let scheduler = scheduler();
        let a = scheduler.submit(JobKind::Immediate, payload()).unwrap();
        let b = scheduler.submit(JobKind::Immediate, payload()).unwrap();
        let c = scheduler.submit(JobKind::Immediate, payload()).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn tick_dispatches_due_jobs_in_id_order() {
        let scheduler = scheduler();
        for _ in 0..3 {
            scheduler.submit(JobKind::Immediate, payload()).unwrap();
        }

        let far_future = Utc::now() + chrono::Duration::seconds(5);
        let dispatched = scheduler.tick(far_future);
        assert_eq!(dispatched, vec![1, 2, 3]);

        for record in scheduler.jobs_snapshot() {
            assert_eq!(record.status, JobStatus::Running);
        }

        // Already-running jobs are not dispatched again.
        assert!(scheduler.tick(far_future).is_empty());
    }

    #[tokio::test]
    async fn delayed_job_is_never_dispatched_before_due() {
        let scheduler = scheduler();
        let due = Utc::now() + chrono::Duration::seconds(60);
        let id = scheduler
            .submit(JobKind::DelayedAt { at: due }, payload())
            .unwrap();

        assert!(scheduler.tick(due - chrono::Duration::seconds(1)).is_empty());
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Pending);

        assert_eq!(scheduler.tick(due), vec![id]);
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn backlog_limit_rejects_the_eleventh_submission() {
        let scheduler = scheduler_with(SchedulerConfig {
            backlog_limit: 10,
            ..SchedulerConfig::default()
        });

        for i in 0..10 {
            scheduler
                .submit(JobKind::Immediate, payload())
                .unwrap_or_else(|e| panic!("submission {i} rejected: {e}"));
        }

        let err = scheduler.submit(JobKind::Immediate, payload()).unwrap_err();
        assert!(matches!(err, SchedulerError::Saturated { backlog: 10 }));
        assert_eq!(scheduler.backlog(), 10);
    }

    #[tokio::test]
    async fn backlog_counts_only_pending_jobs() {
        let scheduler = scheduler();
        scheduler.submit(JobKind::Immediate, payload()).unwrap();
        scheduler.submit(JobKind::Immediate, payload()).unwrap();
        assert_eq!(scheduler.backlog(), 2);

        scheduler.tick(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(scheduler.backlog(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scheduler = scheduler();
        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();

        scheduler.cancel(id);
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Cancelled);

        // Second cancel reaches the same terminal state.
        scheduler.cancel(id);
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Cancelled);

        // Unknown ids are ignored.
        scheduler.cancel(999);
    }

    #[tokio::test]
    async fn cancelled_pending_job_is_never_dispatched() {
        let scheduler = scheduler();
        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();
        scheduler.cancel(id);

        assert!(scheduler.tick(Utc::now() + chrono::Duration::seconds(5)).is_empty());
    }

    #[tokio::test]
    async fn cancel_running_job_finishes_then_cancels() {
        let scheduler = scheduler();
        let id = scheduler
            .submit(
                JobKind::Periodic {
                    schedule: "* * * * * *".to_string(),
                },
                payload(),
            )
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(scheduler.tick(now), vec![id]);

        // Cancellation does not interrupt the in-flight run.
        scheduler.cancel(id);
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Running);

        // After the run completes, the job is cancelled, not rescheduled.
        scheduler.apply_completion(ok_completion(id, now));
        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Cancelled);
        assert!(scheduler.tick(now + chrono::Duration::seconds(60)).is_empty());
    }

    #[tokio::test]
    async fn periodic_job_reschedules_after_success() {
        let scheduler = scheduler();
        let id = scheduler
            .submit(
                JobKind::Periodic {
                    schedule: "* * * * * *".to_string(),
                },
                payload(),
            )
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(2);
        scheduler.tick(now);
        scheduler.apply_completion(ok_completion(id, now));

        let record = scheduler.job(id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.next_run_at > now);
        assert!(record.next_run_at <= now + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn periodic_catch_up_issues_a_single_run() {
        let scheduler = scheduler();
        let id = scheduler
            .submit(
                JobKind::Periodic {
                    // Every minute at second 0.
                    schedule: "0 * * * * *".to_string(),
                },
                payload(),
            )
            .unwrap();

        // Pretend the loop was down for ten minutes: exactly one run fires.
        let late = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(scheduler.tick(late), vec![id]);
        assert!(scheduler.tick(late).is_empty());

        // The schedule resumes from now, not from the missed instants.
        scheduler.apply_completion(ok_completion(id, late));
        let record = scheduler.job(id).unwrap();
        assert!(record.next_run_at > late);
        assert!(record.next_run_at <= late + chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn failure_retries_with_exponential_backoff() {
        let scheduler = scheduler();
        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();

        let t0 = Utc::now() + chrono::Duration::seconds(1);
        scheduler.tick(t0);
        scheduler.apply_completion(err_completion(id, t0));

        let record = scheduler.job(id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.next_run_at, t0 + chrono::Duration::seconds(1));
        assert_eq!(record.last_error.as_deref(), Some("llm backend unavailable"));

        let t1 = record.next_run_at;
        scheduler.tick(t1);
        scheduler.apply_completion(err_completion(id, t1));
        let record = scheduler.job(id).unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.next_run_at, t1 + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn attempts_exhausted_marks_failed_final() {
        let scheduler = scheduler();
        let mut events = scheduler.subscribe();
        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();

        let mut now = Utc::now() + chrono::Duration::seconds(1);
        for _ in 0..3 {
            scheduler.tick(now);
            scheduler.apply_completion(err_completion(id, now));
            now = now + chrono::Duration::seconds(60);
        }

        let record = scheduler.job(id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error.as_deref(), Some("llm backend unavailable"));

        // Failed-final is reported, never silent.
        let final_events: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, JobEvent::FailedFinal { .. }))
            .collect();
        assert_eq!(
            final_events,
            vec![JobEvent::FailedFinal {
                id,
                attempts: 3,
                error: "llm backend unavailable".to_string(),
            }]
        );

        // A failed-final job never runs again.
        assert!(scheduler.tick(now + chrono::Duration::seconds(600)).is_empty());
    }

    #[tokio::test]
    async fn periodic_job_exhausting_attempts_stops_rescheduling() {
        let scheduler = scheduler();
        let id = scheduler
            .submit(
                JobKind::Periodic {
                    schedule: "* * * * * *".to_string(),
                },
                payload(),
            )
            .unwrap();

        let mut now = Utc::now() + chrono::Duration::seconds(2);
        for _ in 0..3 {
            assert_eq!(scheduler.tick(now), vec![id]);
            scheduler.apply_completion(err_completion(id, now));
            now = now + chrono::Duration::seconds(120);
        }

        assert_eq!(scheduler.job(id).unwrap().status, JobStatus::Failed);
        assert!(scheduler.tick(now + chrono::Duration::seconds(600)).is_empty());
    }

    #[tokio::test]
    async fn invalid_cron_schedule_is_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .submit(
                JobKind::Periodic {
                    schedule: "not a schedule".to_string(),
                },
                payload(),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn reschedule_moves_pending_jobs_only() {
        let scheduler = scheduler();
        let due = Utc::now() + chrono::Duration::hours(1);
        let id = scheduler
            .submit(JobKind::DelayedAt { at: due }, payload())
            .unwrap();

        let sooner = Utc::now() + chrono::Duration::seconds(1);
        assert!(scheduler.reschedule(id, sooner));
        let record = scheduler.job(id).unwrap();
        assert_eq!(record.next_run_at, sooner);
        assert_eq!(record.kind, JobKind::DelayedAt { at: sooner });

        scheduler.tick(sooner);
        assert!(!scheduler.reschedule(id, due));
        assert!(!scheduler.reschedule(999, due));
    }

    #[tokio::test]
    async fn events_cover_the_dispatch_cycle() {
        let scheduler = scheduler();
        let mut events = scheduler.subscribe();
        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        scheduler.tick(now);
        scheduler.apply_completion(ok_completion(id, now));

        assert_eq!(
            drain(&mut events),
            vec![JobEvent::Dispatched { id }, JobEvent::Succeeded { id }]
        );
    }

    #[tokio::test]
    async fn store_persists_and_recovers_jobs() {
        let store = StateStore::open_in_memory().unwrap();

        let first = {
            let (dispatcher, _rx) =
                Dispatcher::new(Arc::new(PendingPool), DispatcherConfig::default());
            TaskScheduler::new(SchedulerConfig::default(), dispatcher).with_store(store.clone())
        };
        let running = first.submit(JobKind::Immediate, payload()).unwrap();
        let pending = first
            .submit(
                JobKind::DelayedAt {
                    at: Utc::now() + chrono::Duration::hours(1),
                },
                payload(),
            )
            .unwrap();
        first.tick(Utc::now() + chrono::Duration::seconds(1));
        drop(first);

        // A new process over the same store sees both jobs; the one caught
        // mid-flight is pending again (at-least-once).
        let (dispatcher, _rx) =
            Dispatcher::new(Arc::new(PendingPool), DispatcherConfig::default());
        let second =
            TaskScheduler::new(SchedulerConfig::default(), dispatcher).with_store(store);
        let recovered = second.recover(at(50_000)).unwrap();
        assert_eq!(recovered, 1);

        assert_eq!(second.job(running).unwrap().status, JobStatus::Pending);
        assert_eq!(second.job(pending).unwrap().status, JobStatus::Pending);

        // Id assignment continues past the recovered records.
        let next = second.submit(JobKind::Immediate, payload()).unwrap();
        assert_eq!(next, pending + 1);
    }

    #[test]
    fn retry_backoff_progression() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(retry_backoff(base, cap, 1), Duration::from_secs(1));
        assert_eq!(retry_backoff(base, cap, 2), Duration::from_secs(2));
        assert_eq!(retry_backoff(base, cap, 3), Duration::from_secs(4));
        assert_eq!(retry_backoff(base, cap, 7), Duration::from_secs(60));
        assert_eq!(retry_backoff(base, cap, 40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn scheduler_loop_runs_jobs_end_to_end() {
        let (dispatcher, completions) =
            Dispatcher::new(Arc::new(OkPool), DispatcherConfig::default());
        let scheduler = Arc::new(
            TaskScheduler::new(
                SchedulerConfig {
                    tick_interval: Duration::from_millis(20),
                    ..SchedulerConfig::default()
                },
                dispatcher,
            ),
        );
        let mut events = scheduler.subscribe();
        let handle = Arc::clone(&scheduler).start(completions);

        let id = scheduler.submit(JobKind::Immediate, payload()).unwrap();

        // Wait for the loop to dispatch and apply the completion.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if scheduler.job(id).unwrap().status == JobStatus::Succeeded {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop().await;
        let events = drain(&mut events);
        assert!(events.contains(&JobEvent::Dispatched { id }));
        assert!(events.contains(&JobEvent::Succeeded { id }));
    }
}
