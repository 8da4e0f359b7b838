//! Registry event types.

use dabby_state::{HealthState, InstanceId};

/// Events emitted by the registry as per-instance state changes.
///
/// `FailureThresholdExceeded` is the sole trigger the health monitor acts
/// on to open a circuit; `HealthChanged` is informational (logging,
/// persistence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Consecutive failures moved strictly above the configured threshold,
    /// or a trial request failed while the instance was `Suspect`.
    FailureThresholdExceeded {
        id: InstanceId,
        consecutive_failures: u32,
    },
    /// The instance's health state changed.
    HealthChanged {
        id: InstanceId,
        from: HealthState,
        to: HealthState,
    },
}
