//! Health monitor — background task that probes instances and manages
//! circuit state.
//!
//! One task iterates the whole registry per probe cycle; a failing probe
//! against one instance is isolated and logged, never aborting the cycle.
//! The monitor is the only component that opens circuits, reacting to the
//! registry's failure-threshold events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dabby_registry::{Registry, RegistryEvent};
use dabby_state::HealthState;

use crate::probe::{HttpProbe, Probe};

/// Health monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often every instance is probed.
    pub probe_interval: Duration,
    /// Per-probe timeout; a timed-out probe counts as a failure.
    pub probe_timeout: Duration,
    /// HTTP path probed on each instance.
    pub probe_path: String,
    /// Circuit cooldown after the first open.
    pub base_backoff: Duration,
    /// Cooldown ceiling; doubling stops here.
    pub max_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            probe_path: "/health".to_string(),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the monitor loop to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Probes registered instances and drives circuit-breaker transitions.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    probe: Arc<dyn Probe>,
    config: MonitorConfig,
}

impl HealthMonitor {
    /// Create a monitor with the default HTTP probe.
    pub fn new(registry: Arc<Registry>, config: MonitorConfig) -> Self {
        let probe = Arc::new(HttpProbe::new(
            config.probe_path.clone(),
            config.probe_timeout,
        ));
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Replace the probe implementation (for testing, or non-HTTP checks).
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    /// Spawn the monitor loop. Cancellation is cooperative, checked each
    /// iteration via the returned handle.
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut events = self.registry.subscribe();
            let mut interval = tokio::time::interval(self.config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval = ?self.config.probe_interval,
                "health monitor started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.probe_cycle().await;
                    }
                    event = events.recv() => {
                        match event {
                            Some(e) => self.handle_event(e),
                            // Registry dropped; nothing left to monitor.
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("health monitor shutting down");
                        break;
                    }
                }
            }
        });

        MonitorHandle {
            shutdown_tx,
            handle,
        }
    }

    /// React to a registry event.
    fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::FailureThresholdExceeded { id, consecutive_failures } => {
                let reopen_count = self
                    .registry
                    .snapshot()
                    .iter()
                    .find(|s| s.descriptor.id == id)
                    .map(|s| s.reopen_count)
                    .unwrap_or(0);
                let backoff = circuit_backoff(
                    self.config.base_backoff,
                    self.config.max_backoff,
                    reopen_count,
                );
                warn!(
                    instance_id = %id,
                    consecutive_failures,
                    cooldown = ?backoff,
                    "opening circuit"
                );
                self.registry.open_circuit(&id, Instant::now() + backoff);
            }
            RegistryEvent::HealthChanged { .. } => {}
        }
    }

    /// Probe every instance that is due for a check.
    ///
    /// `Healthy` and `Suspect` instances are probed each cycle; `Unhealthy`
    /// ones only once their circuit cooldown has expired.
    async fn probe_cycle(&self) {
        let now = Instant::now();
        for snap in self.registry.snapshot() {
            let id = &snap.descriptor.id;

            if snap.health == HealthState::Unhealthy {
                let expired = snap.circuit_open_until.is_none_or(|until| until <= now);
                if !expired {
                    continue;
                }
            }

            let result = self.probe.check(&snap.descriptor.address).await;
            if result.is_success() {
                self.registry.record_probe_success(id);
            } else {
                debug!(instance_id = %id, ?result, "probe failed");
                if snap.health == HealthState::Unhealthy {
                    // Still down after the cooldown: re-arm with a doubled
                    // backoff instead of emitting another threshold event.
                    self.registry.record_probe_failure(id);
                    let backoff = circuit_backoff(
                        self.config.base_backoff,
                        self.config.max_backoff,
                        snap.reopen_count,
                    );
                    self.registry.open_circuit(id, Instant::now() + backoff);
                } else {
                    self.registry.record_probe_failure(id);
                }
            }
        }
    }
}

/// Exponential circuit cooldown: `base * 2^reopen_count`, capped.
fn circuit_backoff(base: Duration, cap: Duration, reopen_count: u32) -> Duration {
    let factor = 1u32.checked_shl(reopen_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
