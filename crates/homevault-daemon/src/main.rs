//! HomeVault Daemon - Background auto-sync service
//!
//! This binary runs as a systemd user service and handles:
//! - Scheduling auto-sync for every connected client at startup
//! - Periodic scheduler health checks
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon builds the store, the reconciliation engine and the
//! [`AutoSyncScheduler`] once, starts every auto-sync client, then waits on a
//! `CancellationToken` that is triggered on receipt of SIGTERM or SIGINT.
//! Shutdown lets running passes finish before the process exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use homevault_cache::{DatabasePool, LocalBlobStore, SqliteIdentityStore};
use homevault_core::config::{Config, LoggingConfig};
use homevault_core::domain::{Client, ClientType};
use homevault_core::ports::{IIdentityStore, IProviderAdapter, IProviderFactory, ProviderError};
use homevault_sync::{AutoSyncScheduler, DirectoryProvider, ProviderRegistry, ReconciliationEngine};

/// How often the scheduler's view of its clients is checked
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "homevaultd", version, about = "HomeVault auto-sync daemon")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override `logging.level` from the configuration
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

// ============================================================================
// Provider factory
// ============================================================================

/// Connects clients to the providers this daemon can drive
///
/// External drives are served by a [`DirectoryProvider`] rooted at the
/// client's endpoint (the mount path).
struct DaemonProviderFactory;

#[async_trait::async_trait]
impl IProviderFactory for DaemonProviderFactory {
    async fn connect(&self, client: &Client) -> Result<Arc<dyn IProviderAdapter>> {
        match client.client_type() {
            ClientType::ExternalDrive => {
                let Some(endpoint) = client.endpoint() else {
                    bail!("external drive {} has no mount path", client.id());
                };
                let meta = tokio::fs::metadata(endpoint).await.map_err(|e| {
                    anyhow::Error::new(ProviderError::NotFound(format!("{endpoint}: {e}")))
                })?;
                if !meta.is_dir() {
                    bail!("mount path {endpoint} is not a directory");
                }
                Ok(Arc::new(DirectoryProvider::new(endpoint)))
            }
            other => bail!("no provider available for {other} clients"),
        }
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the scheduler and everything it runs on
struct DaemonService {
    store: Arc<SqliteIdentityStore>,
    scheduler: AutoSyncScheduler,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the database and blob root and wires up the scheduler
    async fn new(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let pool = DatabasePool::open(&config.storage)
            .await
            .context("Failed to open database")?;

        let store = Arc::new(SqliteIdentityStore::new(pool.pool().clone()));
        let blobs = Arc::new(LocalBlobStore::new(&config.storage.blob_root));
        let registry = Arc::new(ProviderRegistry::new());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            blobs,
            registry,
            &config.sync,
        ));
        let factory: Arc<dyn IProviderFactory> = Arc::new(DaemonProviderFactory);
        let scheduler = AutoSyncScheduler::new(store.clone(), engine, Some(factory), &config.sync);

        Ok(Self {
            store,
            scheduler,
            shutdown,
        })
    }

    /// Starts every auto-sync client, then serves until shutdown
    async fn run(&self) -> Result<()> {
        let clients = self
            .store
            .list_auto_sync_clients()
            .await
            .context("Failed to list auto-sync clients")?;

        let mut started = 0;
        for client in &clients {
            match self.scheduler.start(client.id()).await {
                Ok(()) => started += 1,
                Err(e) => warn!(
                    client_id = %client.id(),
                    name = client.display_name(),
                    error = %e,
                    "Could not schedule client"
                ),
            }
        }
        info!(started, total = clients.len(), "Auto-sync clients scheduled");

        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        // The first tick fires immediately
        health.tick().await;

        loop {
            tokio::select! {
                _ = health.tick() => {
                    let report = self.scheduler.health_check().await;
                    for issue in &report.issues {
                        warn!(client_id = %issue.client, reason = %issue.reason, "Scheduled client unhealthy");
                    }
                    info!(
                        scheduled = report.total_scheduled,
                        healthy = report.healthy_count,
                        "Health check"
                    );
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.scheduler.shutdown().await;
        Ok(())
    }
}

// ============================================================================
// Startup helpers
// ============================================================================

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        bail!("Invalid configuration: {joined}");
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_tracing(&config.logging, cli.log_level.as_deref());

    info!("HomeVault daemon starting (homevaultd)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(&config, shutdown_token).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("HomeVault daemon stopped"),
        Err(e) => error!(error = %format!("{e:#}"), "HomeVault daemon failed"),
    }
    result
}
