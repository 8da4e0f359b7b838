//! dabby-health — liveness probing and circuit breaking.
//!
//! A single background task probes every registered instance on a fixed
//! interval and drives the registry's health transitions:
//!
//! - failure-threshold events from the registry open the circuit
//!   (`Unhealthy`, with exponentially growing cooldown),
//! - an expired cooldown earns the instance one probe; success moves it to
//!   `Suspect` (half-open, one trial request allowed),
//! - a further success restores `Healthy`; any failure while `Suspect`
//!   re-opens the circuit with a doubled cooldown.
//!
//! Probing is pluggable through the [`Probe`] trait; the default
//! [`HttpProbe`] issues a GET against the instance's health endpoint.

pub mod monitor;
pub mod probe;

pub use monitor::{HealthMonitor, MonitorConfig, MonitorHandle};
pub use probe::{HttpProbe, Probe, ProbeFuture, ProbeResult};
