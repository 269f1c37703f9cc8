//! Per-device RMM endpoint agent
//!
//! Boots by picking a reachable endpoint (C2), checking in for a bootstrap
//! task/policy snapshot (C13), then running four long-lived loops
//! concurrently: the reconnecting duplex channel client (C6, which drives
//! the heartbeat sender and inbound message dispatch), the local task runner
//! (C4+C5), the network-change event watcher (C7), and a weekly endpoint
//! reprobe ticker. All four share the durable task cache, state blob, and
//! outbox behind `Arc<Mutex<_>>` handles passed down from `main`.

// Use jemalloc as the global allocator for better performance on long-running
// daemons, matching the rest of this workspace's binaries.
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod channel_client;
mod collectors;
mod config;
mod database;
mod endpoint;
mod event_watcher;
mod executor;
mod install;
mod logging;
mod reprobe_ticker;
mod state;
mod task_runner;
mod task_store;
mod telemetry;
mod trigger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use shared::model::PacingPolicy;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use channel_client::ChannelContext;
use config::ConfigManager;
use database::AgentDatabase;
use state::StateStore;
use task_store::TaskStore;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line surface from §6: install/uninstall/status manage the boot
/// entry and single-instance guard; foreground skips both for interactive
/// runs; the no-arg case is the normal background run.
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Per-device agent that checks in, runs dispatched tasks locally, and streams results back", long_about = None)]
struct CliArgs {
    /// Stage this binary into the shared data directory, register a
    /// boot-time start entry, and launch it immediately.
    #[arg(long)]
    install: bool,

    /// Remove the boot-time start entry registered by `--install`.
    #[arg(long)]
    uninstall: bool,

    /// Print whether the boot-time start entry is currently registered.
    #[arg(long)]
    status: bool,

    /// Run without the single-instance guard or console hiding.
    #[arg(long)]
    foreground: bool,

    /// Directory holding `agent.toml`, `state.json`, `scheduled_tasks.json`,
    /// the outbox database, and `agent.log`. Defaults to the platform
    /// shared-data directory.
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the primary candidate endpoint from config file
    #[arg(long = "server-endpoint", value_name = "URL")]
    server_endpoint: Option<String>,

    /// Override the shared agent token from config file
    #[arg(long = "agent-token", value_name = "TOKEN")]
    agent_token: Option<String>,
}

/// Owns every long-lived task's `JoinHandle` so shutdown can wait on each
/// with a bounded timeout, mirroring the server binary's shutdown sequence.
struct Agent {
    config_manager: ConfigManager,
    ctx: Arc<ChannelContext>,
    channel_handle: Option<tokio::task::JoinHandle<()>>,
    task_runner_handle: Option<tokio::task::JoinHandle<()>>,
    event_watcher_handle: Option<tokio::task::JoinHandle<()>>,
    reprobe_handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl Agent {
    async fn bootstrap(data_dir: PathBuf, mut config_manager: ConfigManager) -> Result<Self> {
        let device_id = match config_manager.config.device_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                info!(device_id = %id, "Minted new device_id on first launch");
                config_manager.config.device_id = Some(id);
                config_manager.persist().context("persisting minted device_id")?;
                id
            }
        };

        let state = StateStore::load(&data_dir).context("loading agent state")?;
        let tasks = TaskStore::load(&data_dir).context("loading local task cache")?;
        let mut outbox = AgentDatabase::new(&data_dir, config_manager.config.outbox_busy_timeout_seconds)
            .context("opening outbox database")?;
        outbox.initialize().context("initializing outbox database")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;

        let cfg = &config_manager.config;
        let ctx = Arc::new(ChannelContext {
            device_id,
            agent_token: cfg.agent_token.clone(),
            agent_version: Some(AGENT_VERSION.to_string()),
            candidate_endpoints: cfg.candidate_endpoints.clone(),
            endpoint_probe_timeout: Duration::from_secs(cfg.endpoint_probe_timeout_seconds),
            endpoint_reprobe_age: Duration::from_secs(cfg.endpoint_reprobe_age_seconds),
            channel_keepalive: Duration::from_secs(cfg.channel_keepalive_seconds),
            channel_keepalive_timeout: Duration::from_secs(cfg.channel_keepalive_timeout_seconds),
            reconnect_backoff: Duration::from_secs(cfg.channel_reconnect_backoff_seconds),
            executor_timeout_seconds: cfg.executor_timeout_seconds,
            state: Arc::new(Mutex::new(state)),
            tasks: Arc::new(Mutex::new(tasks)),
            policy: Arc::new(Mutex::new(PacingPolicy::default())),
            outbox: Arc::new(Mutex::new(outbox)),
            http,
        });

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Ok(Self {
            config_manager,
            ctx,
            channel_handle: None,
            task_runner_handle: None,
            event_watcher_handle: None,
            reprobe_handle: None,
            shutdown_tx,
        })
    }

    /// Spawn the four long-lived loops and return once all are running. Does
    /// not block; callers should await `shutdown()` on signal receipt.
    fn run(&mut self) {
        let cfg = &self.config_manager.config;
        info!(
            device_id = %self.ctx.device_id,
            candidate_endpoints = ?self.ctx.candidate_endpoints,
            "Starting agent background loops"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // Agent channel client (C6): reconnecting duplex link, heartbeat
        // sender, and inbound message dispatch.
        {
            let ctx = self.ctx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.channel_handle = Some(tokio::spawn(async move {
                channel_client::run(ctx, outbound_rx, shutdown_rx).await;
            }));
        }

        // Local task runner (C4 + C5 driver).
        {
            let ctx = self.ctx.clone();
            let outbound_tx = outbound_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.task_runner_handle = Some(tokio::spawn(async move {
                task_runner::run(ctx, outbound_tx, shutdown_rx).await;
            }));
        }

        // Event watcher (C7): network-change detection gating event tasks.
        {
            let ctx = self.ctx.clone();
            let tasks = self.ctx.tasks.clone();
            let state = self.ctx.state.clone();
            let interval = Duration::from_secs(cfg.event_watcher_interval_seconds);
            let outbound_tx = outbound_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.event_watcher_handle = Some(tokio::spawn(async move {
                event_watcher::run(ctx, tasks, state, interval, outbound_tx, shutdown_rx).await;
            }));
        }

        // Weekly endpoint-reprobe ticker: forces a fresh candidate probe on
        // a fixed schedule even while a connection is live.
        {
            let candidates = self.ctx.candidate_endpoints.clone();
            let state = self.ctx.state.clone();
            let probe_timeout = self.ctx.endpoint_probe_timeout;
            let interval = self.ctx.endpoint_reprobe_age;
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.reprobe_handle = Some(tokio::spawn(async move {
                reprobe_ticker::run(candidates, state, probe_timeout, interval, shutdown_rx).await;
            }));
        }
    }

    /// Broadcasts the shutdown signal to every background loop and waits for
    /// each to finish, bounded by the configured graceful-shutdown timeout.
    async fn shutdown(&mut self) {
        info!("Shutting down agent gracefully");

        let timeout = Duration::from_secs(self.config_manager.config.graceful_shutdown_timeout_seconds);
        let _ = self.shutdown_tx.send(());

        let handles = [
            ("channel client", self.channel_handle.take()),
            ("local task runner", self.task_runner_handle.take()),
            ("event watcher", self.event_watcher_handle.take()),
            ("endpoint reprobe ticker", self.reprobe_handle.take()),
        ];

        for (name, handle) in handles {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("{name} completed successfully"),
                Ok(Err(e)) => warn!("{name} panicked: {e}"),
                Err(_) => warn!("{name} shutdown timeout reached, aborting"),
            }
        }

        {
            let mut outbox = self.ctx.outbox.lock().await;
            outbox.close();
        }

        info!("Agent shutdown complete");
    }
}

/// On Unix, handles SIGTERM and SIGINT. On non-Unix, handles Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

fn init_logging(data_dir: &std::path::Path, max_bytes: u64, max_files: u32) -> Result<()> {
    let size_rotating = logging::SizeRotatingWriter::new(data_dir.join("agent.log"), max_bytes, max_files)
        .context("opening agent.log for size-rotating writes")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(size_rotating);
    // Leaking the guard keeps the non-blocking writer's background flush
    // thread alive for the process lifetime, matching how the donor's
    // `_guard` binding in `main` is kept in scope until shutdown.
    std::mem::forget(guard);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let data_dir = cli_args.data_dir.clone().unwrap_or_else(install::default_data_dir);

    if cli_args.status {
        install::status();
        return Ok(());
    }
    if cli_args.uninstall {
        if let Err(e) = install::uninstall() {
            eprintln!("Failed to uninstall boot entry: {e}");
            std::process::exit(1);
        }
        println!("Boot-time start entry removed");
        return Ok(());
    }
    if cli_args.install {
        if let Err(e) = install::install(&data_dir) {
            eprintln!("Failed to install agent: {e}");
            std::process::exit(1);
        }
        println!("Agent staged, registered for boot-time start, and launched");
        return Ok(());
    }

    if !cli_args.foreground {
        match install::acquire_single_instance_guard(&data_dir) {
            Ok(true) => {}
            Ok(false) => {
                // Exit code 0: another instance holds the guard, this is not
                // an error condition per §6's exit-code table.
                return Ok(());
            }
            Err(e) => {
                eprintln!("Failed to acquire single-instance guard: {e}");
                std::process::exit(1);
            }
        }
    }

    let mut config_manager = match ConfigManager::new(data_dir.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to load agent configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(
        &data_dir,
        config_manager.config.agent_log_max_bytes,
        config_manager.config.agent_log_max_files,
    ) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!("Agent starting up");
    info!(data_dir = %data_dir.display(), "Configuration directory");

    let has_overrides = cli_args.server_endpoint.is_some() || cli_args.agent_token.is_some();
    if has_overrides {
        match config_manager.override_and_persist(cli_args.server_endpoint, cli_args.agent_token, None) {
            Ok(changed) => {
                if changed {
                    info!("Configuration overrides applied and persisted to disk");
                }
            }
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut agent = match Agent::bootstrap(data_dir, config_manager).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize agent: {}", e);
            std::process::exit(1);
        }
    };

    agent.run();

    setup_shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown");

    agent.shutdown().await;
    info!("Agent shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn bootstrap_mints_device_id_on_first_run() {
        let dir = TempDir::new().unwrap();
        let config_manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        assert!(config_manager.config.device_id.is_none());

        let agent = Agent::bootstrap(dir.path().to_path_buf(), config_manager).await.unwrap();
        assert!(agent.config_manager.config.device_id.is_some());

        let reloaded = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.config.device_id, agent.config_manager.config.device_id);
    }

    #[tokio::test]
    async fn bootstrap_reuses_existing_device_id() {
        let dir = TempDir::new().unwrap();
        let mut config_manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        let id = Uuid::new_v4();
        config_manager.config.device_id = Some(id);
        config_manager.persist().unwrap();

        let agent = Agent::bootstrap(dir.path().to_path_buf(), config_manager).await.unwrap();
        assert_eq!(agent.config_manager.config.device_id, Some(id));
    }
}
