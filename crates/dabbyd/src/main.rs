//! dabbyd — the dabby daemon.
//!
//! Single binary that assembles the request-distribution and scheduling
//! core:
//! - Instance registry (from `[[instance]]` config entries)
//! - Load balancer (strategy from config)
//! - Health monitor (liveness probes + circuit breaker)
//! - Task scheduler + dispatcher (balancer-routed execution)
//! - Optional redb job store with at-least-once recovery
//!
//! # Usage
//!
//! ```text
//! dabbyd run --config dabby.toml --data-dir /var/lib/dabby
//! ```

mod agent_pool;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use dabby_balance::Balancer;
use dabby_core::DabbyConfig;
use dabby_health::{HealthMonitor, MonitorConfig};
use dabby_jobs::{Dispatcher, DispatcherConfig, JobEvent, SchedulerConfig, TaskScheduler};
use dabby_registry::{Registry, RegistryConfig, RegistryEvent};
use dabby_state::{InstanceDescriptor, StateStore};

use agent_pool::ForwardingAgentPool;

/// Per-request ceiling on forwarded agent calls.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dabbyd", about = "Dabby request-distribution daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "dabby.toml")]
        config: PathBuf,

        /// Data directory for the persistent job store. Jobs are held in
        /// memory only when omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dabbyd=debug,dabby=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
    }
}

async fn run(config_path: PathBuf, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!(config = ?config_path, "dabbyd starting");
    let config = DabbyConfig::from_file(&config_path)?;

    // ── Initialize subsystems ──────────────────────────────────────

    // Instance registry.
    let registry = Arc::new(Registry::new(RegistryConfig {
        unhealthy_threshold: config.unhealthy_threshold(),
        ema_smoothing: config.ema_smoothing(),
    }));
    for entry in &config.instances {
        registry.register(
            InstanceDescriptor::new(&entry.id, &entry.address)
                .with_weight(entry.weight())
                .with_max_connections(
                    entry
                        .max_connections
                        .unwrap_or_else(|| config.max_connections_per_instance()),
                ),
        );
    }
    if registry.is_empty() {
        warn!("no instances configured; requests will fail until instances register");
    }
    info!(instances = registry.len(), "instance registry initialized");

    // Load balancer.
    let balancer = Arc::new(Balancer::new(Arc::clone(&registry), config.strategy()));
    info!(strategy = ?config.strategy(), "load balancer initialized");

    // Health monitor.
    let monitor_handle = HealthMonitor::new(
        Arc::clone(&registry),
        MonitorConfig {
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            probe_path: config.probe_path(),
            base_backoff: config.circuit_base_backoff(),
            max_backoff: config.circuit_max_backoff(),
        },
    )
    .start();
    info!(interval = ?config.probe_interval(), "health monitor started");

    // Job store.
    let store = match &data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("dabby.redb");
            let store = StateStore::open(&path)?;
            info!(?path, "job store opened");
            Some(store)
        }
        None => None,
    };

    // Dispatcher + scheduler, executing through the balancer.
    let pool = Arc::new(ForwardingAgentPool::new(
        Arc::clone(&balancer),
        REQUEST_TIMEOUT,
    ));
    let (dispatcher, completions) = Dispatcher::new(
        pool,
        DispatcherConfig {
            worker_concurrency: config.worker_concurrency(),
        },
    );
    let dispatcher = dispatcher.with_registry(Arc::clone(&registry));

    let mut scheduler = TaskScheduler::new(
        SchedulerConfig {
            tick_interval: config.tick_interval(),
            max_job_attempts: config.max_job_attempts(),
            backlog_limit: config.backlog_limit(),
            ..SchedulerConfig::default()
        },
        dispatcher,
    );
    if let Some(store) = store.clone() {
        scheduler = scheduler.with_store(store);
    }
    let scheduler = Arc::new(scheduler);
    let recovered = scheduler.recover(Utc::now())?;
    if recovered > 0 {
        info!(recovered, "jobs recovered from store");
    }

    spawn_registry_observer(Arc::clone(&registry), store);
    spawn_job_observer(&scheduler);

    let scheduler_handle = Arc::clone(&scheduler).start(completions);
    info!(
        workers = config.worker_concurrency(),
        tick = ?config.tick_interval(),
        "task scheduler started"
    );

    // ── Run until shutdown ─────────────────────────────────────────

    info!("dabbyd running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler_handle.stop().await;
    monitor_handle.stop().await;
    info!("dabbyd stopped");
    Ok(())
}

/// Log health transitions and mirror them into the store when one is
/// configured.
fn spawn_registry_observer(registry: Arc<Registry>, store: Option<StateStore>) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let RegistryEvent::HealthChanged { id, from, to } = event {
                info!(instance_id = %id, ?from, ?to, "instance health changed");
                if let Some(store) = &store {
                    let record = registry
                        .snapshot()
                        .iter()
                        .find(|s| s.descriptor.id == id)
                        .map(|s| s.to_health_record(Utc::now().timestamp() as u64));
                    if let Some(record) = record {
                        if let Err(e) = store.put_instance_health(&record) {
                            error!(instance_id = %id, error = %e, "failed to persist health record");
                        }
                    }
                }
            }
        }
    });
}

/// Surface job lifecycle events; failed-final jobs are reported at error
/// level with their attempt count and last error.
fn spawn_job_observer(scheduler: &Arc<TaskScheduler>) {
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::FailedFinal {
                    id,
                    attempts,
                    error,
                } => {
                    error!(job_id = id, attempts, %error, "job failed permanently");
                }
                JobEvent::Retrying {
                    id,
                    attempts,
                    next_run_at,
                } => {
                    warn!(job_id = id, attempts, retry_at = %next_run_at, "job will retry");
                }
                JobEvent::Succeeded { id } => info!(job_id = id, "job succeeded"),
                JobEvent::Cancelled { id } => info!(job_id = id, "job cancelled"),
                JobEvent::Dispatched { .. } => {}
            }
        }
    });
}
