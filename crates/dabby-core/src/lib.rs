//! dabby-core — configuration types for the dabby request-distribution
//! and task-scheduling core.
//!
//! Parses `dabby.toml` into typed sections and resolves every option to a
//! concrete value with a documented default. The balancing strategy is a
//! closed enum resolved at load time, so callers never do runtime string
//! lookups.

pub mod config;
pub mod duration;

pub use config::{
    BalancerSection, DabbyConfig, HealthSection, InstanceEntry, SchedulerSection, Strategy,
};
pub use duration::parse_duration;
