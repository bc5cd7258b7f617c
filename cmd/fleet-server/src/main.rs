mod supervisor;

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkg_cloud::SimulatedCloud;
use pkg_constants::health::DEFAULT_UNHEALTHY_THRESHOLD;
use pkg_constants::paths::{
    DEFAULT_DESIRED_STATE, DEFAULT_RELOAD_INTERVAL_SECS, DEFAULT_SERVER_CONFIG,
};
use pkg_constants::rollout::{
    DEFAULT_APPLY_CONCURRENCY, DEFAULT_TICK_INTERVAL_SECS, EVENT_LOG_CAPACITY,
};
use pkg_controllers::events::EventLog;
use pkg_controllers::fleet::OrchestratorConfig;
use pkg_metrics::MetricsRegistry;
use pkg_types::config::{OrchestratorConfigFile, load_config_file, load_desired_state};

use crate::supervisor::Supervisor;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-server", about = "Scale-set fleet orchestrator")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Path to the desired-state file (YAML list of scale sets)
    #[arg(long)]
    desired_state: Option<String>,

    /// Seconds between reconcile ticks of each scale set
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Maximum concurrent cloud calls per extension level
    #[arg(long)]
    apply_concurrency: Option<usize>,

    /// Consecutive failed probes before an instance counts as unhealthy
    #[arg(long)]
    unhealthy_threshold: Option<u32>,

    /// Seconds between re-reads of the desired-state file
    #[arg(long)]
    reload_interval: Option<u64>,

    /// Instances to seed per new scale set in the simulated cloud
    #[arg(long)]
    simulated_instances: Option<u32>,

    /// Request an upgrade of every instance of Manual scale sets at startup
    #[arg(long)]
    manual_upgrade: bool,

    /// Write Prometheus text metrics to this file after every reload
    #[arg(long)]
    metrics_file: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn write_metrics(path: &str, metrics: &MetricsRegistry) {
    if let Err(e) = std::fs::write(path, metrics.render()) {
        warn!("Failed to write metrics to {}: {}", path, e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    // Load config file (returns defaults if file not found)
    let file_cfg: OrchestratorConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let desired_state = cli
        .desired_state
        .or(file_cfg.desired_state)
        .unwrap_or_else(|| DEFAULT_DESIRED_STATE.to_string());
    let tick_interval = cli
        .tick_interval
        .or(file_cfg.tick_interval_secs)
        .unwrap_or(DEFAULT_TICK_INTERVAL_SECS)
        .max(1);
    let apply_concurrency = cli
        .apply_concurrency
        .or(file_cfg.apply_concurrency)
        .unwrap_or(DEFAULT_APPLY_CONCURRENCY)
        .max(1);
    let unhealthy_threshold = cli
        .unhealthy_threshold
        .or(file_cfg.unhealthy_threshold)
        .unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD);
    let reload_interval = cli
        .reload_interval
        .or(file_cfg.reload_interval_secs)
        .unwrap_or(DEFAULT_RELOAD_INTERVAL_SECS)
        .max(1);
    let simulated_instances = cli.simulated_instances.or(file_cfg.simulated_instances);

    info!("Starting fleet-server");
    info!("  Desired state:     {}", desired_state);
    info!("  Tick interval:     {}s", tick_interval);
    info!("  Apply concurrency: {}", apply_concurrency);
    info!("  Unhealthy after:   {} failed probe(s)", unhealthy_threshold);
    info!("  Reload interval:   {}s", reload_interval);

    let initial = load_desired_state(&desired_state)?;

    let metrics = Arc::new(MetricsRegistry::with_fleet_metrics());
    let events = EventLog::new(EVENT_LOG_CAPACITY, metrics.clone());
    let config = OrchestratorConfig {
        tick_interval: Duration::from_secs(tick_interval),
        apply_concurrency,
        unhealthy_threshold,
    };
    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(
        SimulatedCloud::new(),
        events,
        config,
        simulated_instances,
        cancel.clone(),
    );

    supervisor.apply(initial);
    info!("Managing scale sets: [{}]", supervisor.scale_sets().join(", "));
    if cli.manual_upgrade {
        let requested = supervisor.upgrade_manual_scale_sets();
        info!("Manual upgrade requested for {} scale set(s)", requested);
    }

    let mut reload = tokio::time::interval(Duration::from_secs(reload_interval));
    // The first tick fires immediately; the initial state is already applied.
    reload.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
            _ = reload.tick() => {
                match load_desired_state(&desired_state) {
                    Ok(desired) => {
                        let changed = supervisor.apply(desired);
                        if changed > 0 {
                            info!("Reloaded desired state: {} scale set(s) changed", changed);
                        }
                    }
                    Err(e) => warn!("Keeping previous desired state: {}", e),
                }
                if let Some(path) = &cli.metrics_file {
                    write_metrics(path, &metrics);
                }
            }
        }
    }

    supervisor.shutdown().await;
    if let Some(path) = &cli.metrics_file {
        write_metrics(path, &metrics);
    }
    info!("fleet-server stopped\n{}", metrics.render());
    Ok(())
}
