//! RMM control plane server
//!
//! Tracks fleet liveness over a persistent duplex channel, dispatches tasks,
//! evaluates alert rules, and fans live state out to operator dashboards. The
//! binary wires together the config/database layers and a pool of background
//! loops (task dispatcher, offline detector, alert rule engine, push bridge,
//! scheduled-report ticker) alongside the axum HTTP/WS server, all sharing a
//! single broadcast shutdown signal.

// Use jemalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod agent_ws;
mod alert_engine;
mod api;
mod checkin;
mod config;
mod connection_registry;
mod dashboard_ws;
mod database;
mod dispatcher;
mod email;
mod offline_detector;
mod push_bridge;
mod reports;

use api::AppState;
use config::ConfigManager;
use connection_registry::ConnectionRegistry;
use email::LoggingEmailNotifier;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Control plane server for a monitored device fleet", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml), or a directory containing one
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the shared agent secret from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the database path from config file
    #[arg(long = "database-path", value_name = "PATH")]
    database_path: Option<String>,
}

/// The main application structure. Owns every background task's `JoinHandle`
/// so shutdown can wait on each with a bounded timeout, mirroring the
/// donor's per-task shutdown sequence.
pub struct Server {
    config_manager: ConfigManager,
    listen_address: SocketAddr,
    database: Option<Arc<Mutex<database::ServerDatabase>>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    offline_detector_handle: Option<JoinHandle<()>>,
    alert_engine_handle: Option<JoinHandle<()>>,
    push_bridge_handle: Option<JoinHandle<()>>,
    reports_handle: Option<JoinHandle<()>>,
    cleanup_handle: Option<JoinHandle<()>>,
    wal_checkpoint_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Server {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let listen_address: SocketAddr = config_manager.config.listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "Invalid listen address '{}': {}",
                config_manager.config.listen_address,
                e
            )
        })?;

        Ok(Self {
            config_manager,
            listen_address,
            database: None,
            dispatcher_handle: None,
            offline_detector_handle: None,
            alert_engine_handle: None,
            push_bridge_handle: None,
            reports_handle: None,
            cleanup_handle: None,
            wal_checkpoint_handle: None,
            shutdown_tx: None,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting RMM control plane server");

        let config = Arc::new(self.config_manager.config.clone());
        info!(
            listen_address = %self.listen_address,
            database_path = %config.database_path,
            retention_days = config.data_retention_days,
            "Server configuration loaded"
        );

        if config.api_key.is_empty() {
            anyhow::bail!("api_key must be set before starting the server (configuration failure is fatal on boot)");
        }

        let mut database = database::ServerDatabase::new(&config.database_path, config.database_busy_timeout_seconds)
            .context("Failed to create database manager")?;
        database.initialize().context("Failed to initialize database")?;
        let database = Arc::new(Mutex::new(database));
        self.database = Some(Arc::clone(&database));
        info!("Database initialized successfully");

        let registry = ConnectionRegistry::new();
        let notifier: Arc<dyn email::EmailNotifier> = Arc::new(LoggingEmailNotifier);

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Task dispatcher (C9)
        {
            let database = Arc::clone(&database);
            let registry = registry.clone();
            let interval = Duration::from_secs(config.dispatcher_tick_seconds);
            let shutdown_rx = shutdown_tx.subscribe();
            self.dispatcher_handle = Some(tokio::spawn(async move {
                dispatcher::run(database, registry, interval, shutdown_rx).await;
            }));
        }

        // Offline detector (C11)
        {
            let database = Arc::clone(&database);
            let registry = registry.clone();
            let notifier = Arc::clone(&notifier);
            let offline_minutes = config.offline_minutes;
            let tick_interval = Duration::from_secs(config.offline_detector_tick_seconds);
            let warmup = Duration::from_secs(config.offline_detector_warmup_seconds);
            let shutdown_rx = shutdown_tx.subscribe();
            self.offline_detector_handle = Some(tokio::spawn(async move {
                offline_detector::run(database, registry, notifier, offline_minutes, tick_interval, warmup, shutdown_rx).await;
            }));
        }

        // Alert rule engine (C12)
        {
            let database = Arc::clone(&database);
            let registry = registry.clone();
            let notifier = Arc::clone(&notifier);
            let tick_interval = Duration::from_secs(config.alert_engine_tick_seconds);
            let warmup = Duration::from_secs(config.alert_engine_warmup_seconds);
            let shutdown_rx = shutdown_tx.subscribe();
            self.alert_engine_handle = Some(tokio::spawn(async move {
                alert_engine::run(database, registry, notifier, tick_interval, warmup, shutdown_rx).await;
            }));
        }

        // Push bridge (C10) — in-process source today; a real pub/sub
        // transport plugs in by constructing a different `PushSource`.
        {
            let (_publisher, source) = push_bridge::in_process_channel(64);
            let registry = registry.clone();
            let backoff = Duration::from_secs(config.push_bridge_backoff_seconds);
            let shutdown_rx = shutdown_tx.subscribe();
            self.push_bridge_handle = Some(tokio::spawn(async move {
                push_bridge::run(Box::new(source), registry, backoff, shutdown_rx).await;
            }));
        }

        // Scheduled-report ticker (stub collaborator seam)
        {
            let tick_interval = Duration::from_secs(3600);
            let shutdown_rx = shutdown_tx.subscribe();
            self.reports_handle = Some(tokio::spawn(async move {
                reports::run(tick_interval, shutdown_rx).await;
            }));
        }

        // Periodic retention cleanup
        {
            let database = Arc::clone(&database);
            let metric_retention_days = config.metric_retention_days;
            let result_retention_days = config.data_retention_days;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.cleanup_handle = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            info!("Running periodic database cleanup");
                            let mut db = database.lock().await;
                            if let Err(e) = db.cleanup_old_data(metric_retention_days, result_retention_days) {
                                error!("Database cleanup failed: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Cleanup task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        // Periodic WAL checkpoint
        {
            let database = Arc::clone(&database);
            let interval_secs = config.wal_checkpoint_interval_seconds;
            let mut shutdown_rx = shutdown_tx.subscribe();
            self.wal_checkpoint_handle = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let mut db = database.lock().await;
                            match db.checkpoint_wal() {
                                Ok(frames) => info!(frames, "WAL checkpoint completed"),
                                Err(e) => warn!("WAL checkpoint failed: {}", e),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("WAL checkpoint task received shutdown signal");
                            break;
                        }
                    }
                }
            }));
        }

        let app_state = AppState::new(config, database, registry, notifier);
        let app = api::create_router(app_state);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("Failed to bind TCP listener to {}", self.listen_address))?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Broadcasts the shutdown signal to every background loop and waits for
    /// each to finish, bounded by the configured graceful-shutdown timeout.
    pub async fn shutdown(&mut self) {
        info!("Shutting down RMM control plane server gracefully");

        let timeout = Duration::from_secs(self.config_manager.config.graceful_shutdown_timeout_seconds);

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        let handles = [
            ("task dispatcher", self.dispatcher_handle.take()),
            ("offline detector", self.offline_detector_handle.take()),
            ("alert rule engine", self.alert_engine_handle.take()),
            ("push bridge", self.push_bridge_handle.take()),
            ("report ticker", self.reports_handle.take()),
            ("cleanup task", self.cleanup_handle.take()),
            ("WAL checkpoint task", self.wal_checkpoint_handle.take()),
        ];

        for (name, handle) in handles {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("{name} completed successfully"),
                Ok(Err(e)) => warn!("{name} panicked: {e}"),
                Err(_) => warn!("{name} shutdown timeout reached, aborting"),
            }
        }

        if let Some(database) = &self.database {
            let mut db = database.lock().await;
            db.close();
        }

        info!("Server shutdown complete");
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

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("RMM control plane server starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut server = match Server::new(cli_args.config_file) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    let has_overrides =
        cli_args.listen_address.is_some() || cli_args.api_key.is_some() || cli_args.database_path.is_some();
    if has_overrides {
        let changed = match server.config_manager.override_and_persist(
            cli_args.listen_address,
            cli_args.api_key,
            cli_args.database_path,
        ) {
            Ok(changed) => changed,
            Err(e) => {
                error!("Failed to apply configuration overrides: {}", e);
                std::process::exit(1);
            }
        };

        if changed {
            server.listen_address = server
                .config_manager
                .config
                .listen_address
                .parse()
                .unwrap_or_else(|e| {
                    error!("Invalid listen address after override: {}", e);
                    std::process::exit(1);
                });
        }
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn server_new_accepts_valid_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
listen_address = "127.0.0.1:8787"
api_key = "test-api-key"
"#
        )
        .unwrap();

        let result = Server::new(temp_file.path().to_path_buf());
        assert!(result.is_ok());
    }

    #[test]
    fn server_new_rejects_invalid_listen_address() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
listen_address = "not-an-address"
api_key = "test-api-key"
"#
        )
        .unwrap();

        let result = Server::new(temp_file.path().to_path_buf());
        assert!(result.is_err());
    }
}
