//! Daemon startup and main loop for restream
//!
//! Provides the daemon entry point, startup sequence, and the run loop that
//! ties the engine, status server, event logger and recovery together.

use crate::config::{Config, ConfigError};
use crate::encoder::ProcessLauncher;
use crate::engine::{Engine, EngineSettings};
use crate::events::log_events;
use crate::probe::MetadataProbe;
use crate::recovery::run_recovery;
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::run_status_server;
use crate::store::{LibraryStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Library could not be opened
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Library backing the engine
    pub store: Arc<LibraryStore>,
    /// Stream orchestration engine
    pub engine: Engine,
    /// Metadata probe for ingestion
    pub probe: MetadataProbe,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (template, encoder, probe)
    /// 3. Open the library under the state directory
    /// 4. Build the engine
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        let store = Arc::new(LibraryStore::open(&config.storage.state_dir)?);
        Ok(Self::assemble(config, store))
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the encoder and probe binaries are not available.
    pub fn new_without_checks(config: Config, store: Arc<LibraryStore>) -> Self {
        Self::assemble(config, store)
    }

    fn assemble(config: Config, store: Arc<LibraryStore>) -> Self {
        let engine = Engine::new(
            store.clone(),
            Arc::new(ProcessLauncher),
            EngineSettings::from_config(&config),
        );
        let probe = MetadataProbe::new(config.probe.program.clone());
        Self {
            config,
            store,
            engine,
            probe,
        }
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task that stops with `shutdown`.
    pub fn start_status_server(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let bind = self.config.server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(engine, &bind, shutdown).await {
                tracing::error!(error = %e, "status server error");
            }
        })
    }

    /// Start the event logger
    pub fn start_event_logger(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(log_events(self.engine.subscribe()))
    }

    /// Schedule the recovery pass after the settling delay, if enabled
    pub fn start_recovery(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.recovery.enabled {
            tracing::info!("recovery disabled");
            return None;
        }
        let engine = self.engine.clone();
        let delay = self.config.recovery.settle_delay();
        Some(tokio::spawn(async move {
            if let Some(report) = run_recovery(engine, delay).await {
                for (stream_id, reason) in &report.failed {
                    tracing::warn!(stream_id = %stream_id, reason = %reason, "stream not recovered");
                }
            }
        }))
    }

    /// Run until `shutdown` resolves, then drain the engine
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: std::future::Future<Output = ()>,
    {
        let server_token = CancellationToken::new();
        let server = self.start_status_server(server_token.clone());
        let logger = self.start_event_logger();
        let recovery = self.start_recovery();

        shutdown.await;
        tracing::info!("shutdown requested");

        if let Some(recovery) = recovery {
            recovery.abort();
        }
        self.engine.shutdown().await;
        server_token.cancel();
        if let Err(e) = server.await {
            tracing::warn!(error = %e, "status server task ended abnormally");
        }
        logger.abort();

        tracing::info!("daemon stopped");
        Ok(())
    }

    /// Run the daemon until Ctrl-C
    pub async fn run(&self) -> Result<(), DaemonError> {
        tracing::info!(
            state_dir = %self.config.storage.state_dir.display(),
            bind = %self.config.server.bind,
            "restream daemon starting"
        );
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }
}
