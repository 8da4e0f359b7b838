//! Strategy-driven instance selection.
//!
//! Round robin uses a lock-free atomic cursor. The stateful strategies
//! (least connections, weighted round robin, response time) serialize the
//! read-and-claim step through one short mutex so two concurrent callers
//! can never both act on the same stale counter read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use dabby_core::Strategy;
use dabby_registry::{BeginRequest, InstanceSnapshot, Registry};
use dabby_state::{HealthState, InstanceDescriptor, InstanceId};

use crate::error::{BalanceError, BalanceResult};

/// One eligible instance, in registration order.
struct Candidate {
    descriptor: InstanceDescriptor,
    active_connections: u32,
    ema_ms: Option<f64>,
}

/// Selects instances from the registry according to a configured strategy.
pub struct Balancer {
    registry: Arc<Registry>,
    strategy: Strategy,
    /// Shared round-robin cursor. Advances monotonically; taken modulo the
    /// live eligible count on each call, so membership changes only shift
    /// the phase.
    cursor: AtomicUsize,
    /// Smooth-weighted-round-robin credit per instance.
    credits: Mutex<HashMap<InstanceId, i64>>,
    /// Serializes selection for the stateful strategies.
    select_lock: Mutex<()>,
}

impl Balancer {
    pub fn new(registry: Arc<Registry>, strategy: Strategy) -> Self {
        Self {
            registry,
            strategy,
            cursor: AtomicUsize::new(0),
            credits: Mutex::new(HashMap::new()),
            select_lock: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select an eligible instance and claim a connection slot on it.
    ///
    /// Never blocks on I/O — only in-memory registry state is consulted.
    /// Fails with `NoHealthyInstance` when no instance is `Healthy` or
    /// `Suspect`-with-free-trial and below its connection cap.
    pub fn select(&self) -> BalanceResult<ConnectionGuard> {
        // Round robin is safe on the atomic cursor alone; the others must
        // not interleave their counter reads with another caller's claim.
        let _serialize = match self.strategy {
            Strategy::RoundRobin => None,
            _ => Some(self.select_lock.lock().unwrap_or_else(|e| e.into_inner())),
        };

        let mut candidates: Vec<Candidate> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(eligible)
            .map(|snap| Candidate {
                active_connections: snap.active_connections,
                ema_ms: snap.ema_ms,
                descriptor: snap.descriptor,
            })
            .collect();

        loop {
            if candidates.is_empty() {
                return Err(BalanceError::NoHealthyInstance);
            }
            let idx = self.choose(&candidates);
            let descriptor = candidates[idx].descriptor.clone();
            match self.registry.try_begin_request(&descriptor.id) {
                BeginRequest::Started { trial } => {
                    debug!(
                        instance_id = %descriptor.id,
                        strategy = ?self.strategy,
                        trial,
                        "balancing decision"
                    );
                    return Ok(ConnectionGuard {
                        registry: Arc::clone(&self.registry),
                        descriptor,
                        trial,
                    });
                }
                // Lost a race with deregistration, a circuit opening, or a
                // concurrent trial claim; drop the candidate and retry.
                BeginRequest::NotEligible | BeginRequest::Unknown => {
                    candidates.remove(idx);
                }
            }
        }
    }

    /// Pick an index into `candidates` (non-empty, registration-ordered).
    fn choose(&self, candidates: &[Candidate]) -> usize {
        match self.strategy {
            Strategy::RoundRobin => self.next_cursor(candidates.len()),
            Strategy::LeastConnections => least_connections(candidates),
            Strategy::WeightedRoundRobin => self.smooth_weighted(candidates),
            Strategy::ResponseTime => self.response_time(candidates),
        }
    }

    fn next_cursor(&self, count: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % count
    }

    /// Smooth weighted round robin: every candidate accrues `weight`
    /// credits, the highest-credit candidate wins and is debited by the
    /// total weight. Produces an interleaved (non-clustered) sequence.
    fn smooth_weighted(&self, candidates: &[Candidate]) -> usize {
        let mut credits = self.credits.lock().unwrap_or_else(|e| e.into_inner());

        // Forget instances that left the eligible set so stale credit
        // cannot accumulate for them.
        credits.retain(|id, _| candidates.iter().any(|c| &c.descriptor.id == id));

        let mut total: i64 = 0;
        let mut best: usize = 0;
        let mut best_credit = i64::MIN;
        for (i, cand) in candidates.iter().enumerate() {
            let weight = cand.descriptor.weight as i64;
            let credit = credits.entry(cand.descriptor.id.clone()).or_insert(0);
            *credit += weight;
            total += weight;
            if *credit > best_credit {
                best_credit = *credit;
                best = i;
            }
        }

        if let Some(credit) = credits.get_mut(&candidates[best].descriptor.id) {
            *credit -= total;
        }
        best
    }

    /// Lowest response-time EMA wins; instances with no data yet count as
    /// zero (they need traffic before they have a number). When every
    /// candidate looks the same, fall back to the round-robin cursor for
    /// this call only.
    fn response_time(&self, candidates: &[Candidate]) -> usize {
        let ema = |c: &Candidate| c.ema_ms.unwrap_or(0.0);
        let first = ema(&candidates[0]);
        if candidates.iter().all(|c| ema(c) == first) {
            return self.next_cursor(candidates.len());
        }
        let mut best = 0;
        for (i, cand) in candidates.iter().enumerate().skip(1) {
            if ema(cand) < ema(&candidates[best]) {
                best = i;
            }
        }
        best
    }
}

/// Minimum active connections, ties broken by registration order.
fn least_connections(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    for (i, cand) in candidates.iter().enumerate().skip(1) {
        if cand.active_connections < candidates[best].active_connections {
            best = i;
        }
    }
    best
}

/// Healthy instances below their connection cap, plus Suspect instances
/// whose single trial token is free.
fn eligible(snap: &InstanceSnapshot) -> bool {
    let has_capacity = snap.active_connections < snap.descriptor.max_connections;
    match snap.health {
        HealthState::Healthy => has_capacity,
        HealthState::Suspect => has_capacity && !snap.trial_in_flight,
        HealthState::Unhealthy => false,
    }
}

/// Scoped claim on one instance connection slot.
///
/// Dropping the guard decrements the instance's active connection count
/// and, for a Suspect trial, frees the trial token — exactly once, on any
/// exit path.
pub struct ConnectionGuard {
    registry: Arc<Registry>,
    descriptor: InstanceDescriptor,
    trial: bool,
}

impl ConnectionGuard {
    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn instance_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Whether this request is the single half-open trial for its instance.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("instance_id", &self.descriptor.id)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.mark_connection_end(&self.descriptor.id);
        if self.trial {
            self.registry.release_trial(&self.descriptor.id);
        }
    }
}
