//! dabby.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;

/// Load-balancing strategy, resolved once at configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    ResponseTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DabbyConfig {
    pub balancer: Option<BalancerSection>,
    pub health: Option<HealthSection>,
    pub scheduler: Option<SchedulerSection>,
    /// Backend instances, in registration order.
    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BalancerSection {
    pub strategy: Option<Strategy>,
    pub max_connections_per_instance: Option<u32>,
    /// EMA smoothing factor for response times (0 < alpha <= 1).
    pub ema_smoothing: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthSection {
    pub unhealthy_threshold: Option<u32>,
    pub probe_interval: Option<String>,
    pub probe_timeout: Option<String>,
    pub probe_path: Option<String>,
    pub circuit_base_backoff: Option<String>,
    pub circuit_max_backoff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerSection {
    pub tick_interval: Option<String>,
    pub worker_concurrency: Option<usize>,
    pub max_job_attempts: Option<u32>,
    pub backlog_limit: Option<usize>,
}

/// One backend instance entry (`[[instance]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub id: String,
    /// Listen address (ip:port) the instance serves on.
    pub address: String,
    pub weight: Option<u32>,
    pub max_connections: Option<u32>,
}

impl DabbyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DabbyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for entry in &self.instances {
            if entry.id.is_empty() {
                anyhow::bail!("instance entry with empty id");
            }
            if entry.weight == Some(0) {
                anyhow::bail!("instance {} has zero weight", entry.id);
            }
        }
        if let Some(alpha) = self.balancer.as_ref().and_then(|b| b.ema_smoothing) {
            if !(alpha > 0.0 && alpha <= 1.0) {
                anyhow::bail!("ema_smoothing must be in (0, 1], got {alpha}");
            }
        }
        Ok(())
    }

    // ── Resolved accessors ─────────────────────────────────────────

    pub fn strategy(&self) -> Strategy {
        self.balancer
            .as_ref()
            .and_then(|b| b.strategy)
            .unwrap_or_default()
    }

    pub fn max_connections_per_instance(&self) -> u32 {
        self.balancer
            .as_ref()
            .and_then(|b| b.max_connections_per_instance)
            .unwrap_or(10)
    }

    pub fn ema_smoothing(&self) -> f64 {
        self.balancer
            .as_ref()
            .and_then(|b| b.ema_smoothing)
            .unwrap_or(0.3)
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.health
            .as_ref()
            .and_then(|h| h.unhealthy_threshold)
            .unwrap_or(3)
    }

    pub fn probe_interval(&self) -> Duration {
        self.duration_opt(self.health.as_ref().and_then(|h| h.probe_interval.as_deref()))
            .unwrap_or(Duration::from_secs(10))
    }

    pub fn probe_timeout(&self) -> Duration {
        self.duration_opt(self.health.as_ref().and_then(|h| h.probe_timeout.as_deref()))
            .unwrap_or(Duration::from_secs(2))
    }

    pub fn probe_path(&self) -> String {
        self.health
            .as_ref()
            .and_then(|h| h.probe_path.clone())
            .unwrap_or_else(|| "/health".to_string())
    }

    pub fn circuit_base_backoff(&self) -> Duration {
        self.duration_opt(
            self.health
                .as_ref()
                .and_then(|h| h.circuit_base_backoff.as_deref()),
        )
        .unwrap_or(Duration::from_secs(5))
    }

    pub fn circuit_max_backoff(&self) -> Duration {
        self.duration_opt(
            self.health
                .as_ref()
                .and_then(|h| h.circuit_max_backoff.as_deref()),
        )
        .unwrap_or(Duration::from_secs(300))
    }

    pub fn tick_interval(&self) -> Duration {
        self.duration_opt(
            self.scheduler
                .as_ref()
                .and_then(|s| s.tick_interval.as_deref()),
        )
        .unwrap_or(Duration::from_secs(1))
    }

    pub fn worker_concurrency(&self) -> usize {
        self.scheduler
            .as_ref()
            .and_then(|s| s.worker_concurrency)
            .unwrap_or(4)
            .max(1)
    }

    pub fn max_job_attempts(&self) -> u32 {
        self.scheduler
            .as_ref()
            .and_then(|s| s.max_job_attempts)
            .unwrap_or(3)
            .max(1)
    }

    pub fn backlog_limit(&self) -> usize {
        self.scheduler
            .as_ref()
            .and_then(|s| s.backlog_limit)
            .unwrap_or(256)
    }

    fn duration_opt(&self, raw: Option<&str>) -> Option<Duration> {
        raw.and_then(parse_duration)
    }
}

impl InstanceEntry {
    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_defaults() {
        let config = DabbyConfig::from_toml_str("").unwrap();
        assert_eq!(config.strategy(), Strategy::RoundRobin);
        assert_eq!(config.unhealthy_threshold(), 3);
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.worker_concurrency(), 4);
        assert_eq!(config.max_job_attempts(), 3);
        assert_eq!(config.backlog_limit(), 256);
        assert_eq!(config.circuit_base_backoff(), Duration::from_secs(5));
        assert_eq!(config.circuit_max_backoff(), Duration::from_secs(300));
        assert!(config.instances.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[balancer]
strategy = "weighted_round_robin"
max_connections_per_instance = 20
ema_smoothing = 0.5

[health]
unhealthy_threshold = 5
probe_interval = "30s"
probe_timeout = "500ms"

[scheduler]
tick_interval = "2s"
worker_concurrency = 8
backlog_limit = 10

[[instance]]
id = "consultant-0"
address = "127.0.0.1:7801"
weight = 3

[[instance]]
id = "auditor-0"
address = "127.0.0.1:7802"
"#;
        let config = DabbyConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.strategy(), Strategy::WeightedRoundRobin);
        assert_eq!(config.max_connections_per_instance(), 20);
        assert_eq!(config.ema_smoothing(), 0.5);
        assert_eq!(config.unhealthy_threshold(), 5);
        assert_eq!(config.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_millis(500));
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.worker_concurrency(), 8);
        assert_eq!(config.backlog_limit(), 10);
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances[0].weight(), 3);
        assert_eq!(config.instances[1].weight(), 1); // default
    }

    #[test]
    fn strategy_parses_snake_case() {
        let toml_str = r#"
[balancer]
strategy = "least_connections"
"#;
        let config = DabbyConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.strategy(), Strategy::LeastConnections);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let toml_str = r#"
[balancer]
strategy = "random"
"#;
        assert!(DabbyConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn zero_weight_is_rejected() {
        let toml_str = r#"
[[instance]]
id = "consultant-0"
address = "127.0.0.1:7801"
weight = 0
"#;
        assert!(DabbyConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn bad_ema_smoothing_is_rejected() {
        let toml_str = r#"
[balancer]
ema_smoothing = 1.5
"#;
        assert!(DabbyConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn roundtrip_through_toml() {
        let toml_str = r#"
[balancer]
strategy = "response_time"

[[instance]]
id = "tax-0"
address = "127.0.0.1:7803"
"#;
        let config = DabbyConfig::from_toml_str(toml_str).unwrap();
        let out = config.to_toml_string().unwrap();
        assert!(out.contains("response_time"));
        assert!(out.contains("tax-0"));
    }
}
