//! The registry proper: descriptor set plus live per-instance state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dabby_state::{HealthState, InstanceDescriptor, InstanceHealthRecord};

use crate::events::RegistryEvent;

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive failures must strictly exceed this before the failure
    /// threshold event fires.
    pub unhealthy_threshold: u32,
    /// EMA smoothing factor for response times (0 < alpha <= 1).
    pub ema_smoothing: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            ema_smoothing: 0.3,
        }
    }
}

/// Outcome of the balancer's atomic acquire step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginRequest {
    /// The connection count was incremented; `trial` is set when the
    /// instance was `Suspect` and this request holds its trial token.
    Started { trial: bool },
    /// The instance is not currently eligible (unhealthy, trial already in
    /// flight, or at its connection cap).
    NotEligible,
    /// No instance with this id is registered.
    Unknown,
}

/// Point-in-time view of one instance, in registration order.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub descriptor: InstanceDescriptor,
    pub health: HealthState,
    pub active_connections: u32,
    pub consecutive_failures: u32,
    /// Smoothed response time in milliseconds, if any outcome was recorded.
    pub ema_ms: Option<f64>,
    pub circuit_open_until: Option<Instant>,
    pub reopen_count: u32,
    pub trial_in_flight: bool,
    pub total_requests: u64,
}

impl InstanceSnapshot {
    /// Convert to the persisted health record form.
    pub fn to_health_record(&self, updated_at: u64) -> InstanceHealthRecord {
        InstanceHealthRecord {
            id: self.descriptor.id.clone(),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            last_response_time_ms: self.ema_ms,
            reopen_count: self.reopen_count,
            updated_at,
        }
    }
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub instances: usize,
    pub healthy: usize,
    pub total_active_connections: u64,
    pub total_requests: u64,
}

/// Live tracking state, guarded by the slot's mutex.
struct Tracking {
    health: HealthState,
    consecutive_failures: u32,
    ema_ms: Option<f64>,
    circuit_open_until: Option<Instant>,
    reopen_count: u32,
    total_requests: u64,
}

impl Tracking {
    fn new() -> Self {
        Self {
            health: HealthState::Healthy,
            consecutive_failures: 0,
            ema_ms: None,
            circuit_open_until: None,
            reopen_count: 0,
            total_requests: 0,
        }
    }
}

/// One registered instance: immutable descriptor plus live counters.
struct InstanceSlot {
    descriptor: InstanceDescriptor,
    active_connections: AtomicU32,
    /// Set while a Suspect trial request is in flight.
    trial: AtomicBool,
    tracking: Mutex<Tracking>,
}

impl InstanceSlot {
    fn new(descriptor: InstanceDescriptor) -> Self {
        Self {
            descriptor,
            active_connections: AtomicU32::new(0),
            trial: AtomicBool::new(false),
            tracking: Mutex::new(Tracking::new()),
        }
    }
}

/// The instance registry. Sole owner of per-instance mutable state.
pub struct Registry {
    config: RegistryConfig,
    /// Slots in registration order.
    slots: RwLock<Vec<InstanceSlot>>,
    /// Event subscribers; closed receivers are dropped on next emit.
    listeners: Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn emit(&self, event: RegistryEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Register an instance. A descriptor with an already-registered id
    /// replaces the old one in place (keeping its registration position)
    /// and resets its live state.
    pub fn register(&self, descriptor: InstanceDescriptor) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.iter_mut().find(|s| s.descriptor.id == descriptor.id) {
            info!(instance_id = %descriptor.id, "instance re-registered, state reset");
            *slot = InstanceSlot::new(descriptor);
        } else {
            info!(instance_id = %descriptor.id, address = %descriptor.address, "instance registered");
            slots.push(InstanceSlot::new(descriptor));
        }
    }

    /// Remove an instance. Returns true if it was registered.
    pub fn deregister(&self, id: &str) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|s| s.descriptor.id != id);
        let removed = slots.len() < before;
        if removed {
            info!(instance_id = %id, "instance deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent point-in-time view of every instance, in registration
    /// order.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .map(|slot| {
                let tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
                InstanceSnapshot {
                    descriptor: slot.descriptor.clone(),
                    health: tracking.health,
                    active_connections: slot.active_connections.load(Ordering::Relaxed),
                    consecutive_failures: tracking.consecutive_failures,
                    ema_ms: tracking.ema_ms,
                    circuit_open_until: tracking.circuit_open_until,
                    reopen_count: tracking.reopen_count,
                    trial_in_flight: slot.trial.load(Ordering::Relaxed),
                    total_requests: tracking.total_requests,
                }
            })
            .collect()
    }

    /// Aggregate statistics over all instances.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for snap in self.snapshot() {
            stats.instances += 1;
            if snap.health == HealthState::Healthy {
                stats.healthy += 1;
            }
            stats.total_active_connections += snap.active_connections as u64;
            stats.total_requests += snap.total_requests;
        }
        stats
    }

    // ── Connection accounting ──────────────────────────────────────

    /// Increment the active connection count. Silent no-op for unknown ids
    /// (the instance may have been deregistered mid-flight).
    pub fn mark_connection_start(&self, id: &str) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) {
            slot.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement the active connection count, saturating at zero. Silent
    /// no-op for unknown ids.
    pub fn mark_connection_end(&self, id: &str) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) {
            let _ = slot
                .active_connections
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Release a Suspect trial token taken by `try_begin_request`.
    pub fn release_trial(&self, id: &str) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) {
            slot.trial.store(false, Ordering::Release);
        }
    }

    /// Atomically check eligibility and claim a connection slot.
    ///
    /// For a `Suspect` instance this also claims the single trial token;
    /// the caller must hand both back (`mark_connection_end`, and
    /// `release_trial` when `trial` was set).
    pub fn try_begin_request(&self, id: &str) -> BeginRequest {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) else {
            return BeginRequest::Unknown;
        };

        let tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
        let trial = match tracking.health {
            HealthState::Healthy => false,
            HealthState::Suspect => {
                // Exactly one trial request at a time.
                if slot
                    .trial
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return BeginRequest::NotEligible;
                }
                true
            }
            HealthState::Unhealthy => return BeginRequest::NotEligible,
        };

        if slot.active_connections.load(Ordering::Relaxed) >= slot.descriptor.max_connections {
            if trial {
                slot.trial.store(false, Ordering::Release);
            }
            return BeginRequest::NotEligible;
        }

        slot.active_connections.fetch_add(1, Ordering::Relaxed);
        BeginRequest::Started { trial }
    }

    // ── Outcome and probe recording ────────────────────────────────

    /// Record the outcome of one routed request. Updates the response-time
    /// EMA and consecutive-failure tracking; silent no-op for unknown ids.
    pub fn record_outcome(&self, id: &str, success: bool, latency: Duration) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) else {
            return;
        };

        let mut tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
        tracking.total_requests += 1;

        let sample_ms = latency.as_secs_f64() * 1000.0;
        let alpha = self.config.ema_smoothing;
        tracking.ema_ms = Some(match tracking.ema_ms {
            Some(prev) => alpha * sample_ms + (1.0 - alpha) * prev,
            None => sample_ms,
        });

        if success {
            tracking.consecutive_failures = 0;
            if tracking.health == HealthState::Suspect {
                // Trial request passed.
                self.promote_to_healthy(slot, &mut tracking);
            }
        } else {
            self.note_failure(slot, &mut tracking);
        }
    }

    /// Record a successful liveness probe.
    ///
    /// Resets the failure count; moves `Unhealthy` to `Suspect` (half-open)
    /// and `Suspect` to `Healthy`.
    pub fn record_probe_success(&self, id: &str) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) else {
            return;
        };

        let mut tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
        tracking.consecutive_failures = 0;
        match tracking.health {
            HealthState::Unhealthy => {
                tracking.health = HealthState::Suspect;
                tracking.circuit_open_until = None;
                slot.trial.store(false, Ordering::Release);
                debug!(instance_id = %id, "circuit half-open, instance suspect");
                self.emit(RegistryEvent::HealthChanged {
                    id: id.to_string(),
                    from: HealthState::Unhealthy,
                    to: HealthState::Suspect,
                });
            }
            HealthState::Suspect => self.promote_to_healthy(slot, &mut tracking),
            HealthState::Healthy => {}
        }
    }

    /// Record a failed liveness probe. Counts toward the same consecutive
    /// failure threshold as request outcomes.
    pub fn record_probe_failure(&self, id: &str) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) else {
            return;
        };
        let mut tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
        self.note_failure(slot, &mut tracking);
    }

    /// Open (or re-arm) the circuit for an instance until the given
    /// instant. Invoked by the health monitor only.
    pub fn open_circuit(&self, id: &str, until: Instant) {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.iter().find(|s| s.descriptor.id == id) else {
            return;
        };

        let mut tracking = slot.tracking.lock().unwrap_or_else(|e| e.into_inner());
        let from = tracking.health;
        tracking.health = HealthState::Unhealthy;
        tracking.circuit_open_until = Some(until);
        tracking.reopen_count = tracking.reopen_count.saturating_add(1);
        slot.trial.store(false, Ordering::Release);

        if from != HealthState::Unhealthy {
            warn!(instance_id = %id, reopen_count = tracking.reopen_count, "circuit opened");
            self.emit(RegistryEvent::HealthChanged {
                id: id.to_string(),
                from,
                to: HealthState::Unhealthy,
            });
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn promote_to_healthy(&self, slot: &InstanceSlot, tracking: &mut Tracking) {
        tracking.health = HealthState::Healthy;
        tracking.circuit_open_until = None;
        tracking.reopen_count = 0;
        slot.trial.store(false, Ordering::Release);
        info!(instance_id = %slot.descriptor.id, "instance recovered to healthy");
        self.emit(RegistryEvent::HealthChanged {
            id: slot.descriptor.id.clone(),
            from: HealthState::Suspect,
            to: HealthState::Healthy,
        });
    }

    fn note_failure(&self, slot: &InstanceSlot, tracking: &mut Tracking) {
        tracking.consecutive_failures += 1;
        let crossed = tracking.consecutive_failures == self.config.unhealthy_threshold + 1;
        let trial_failed = tracking.health == HealthState::Suspect;

        if crossed || trial_failed {
            debug!(
                instance_id = %slot.descriptor.id,
                failures = tracking.consecutive_failures,
                threshold = self.config.unhealthy_threshold,
                trial_failed,
                "failure threshold exceeded"
            );
            self.emit(RegistryEvent::FailureThresholdExceeded {
                id: slot.descriptor.id.clone(),
                consecutive_failures: tracking.consecutive_failures,
            });
        }
    }
}
