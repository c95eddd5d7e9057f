//! Engine module for restream
//!
//! The engine is the single entry point for starting and stopping streams.
//! It is cheap to clone; every clone shares the same registry, store, event
//! bus and launcher.

use crate::encoder::{EncoderLauncher, SpawnError};
use crate::events::{EventBus, StopReason, StreamEvent};
use crate::model::Stream;
use crate::playlist::PlaylistError;
use crate::recovery::{self, RecoveryReport};
use crate::registry::{LiveStatus, StreamHandle, StreamRegistry};
use crate::store::{AuditEntry, StoreError, StreamStore};
use crate::supervisor;
use restream_config::{Config, EncoderConfig, SupervisorConfig};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream {0} is already running")]
    AlreadyRunning(String),

    #[error("stream {0} is not running")]
    NotRunning(String),

    #[error("stream {0} has an empty playlist")]
    EmptyPlaylist(String),

    #[error("stream {0} is disabled")]
    Disabled(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("encoder spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// Stable machine-readable name of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyRunning(_) => "already_running",
            EngineError::NotRunning(_) => "not_running",
            EngineError::EmptyPlaylist(_) => "empty_playlist",
            EngineError::Disabled(_) => "disabled",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::Playlist(_) => "invalid_playlist",
            EngineError::Spawn(_) => "spawn_failed",
            EngineError::Storage(_) => "storage",
        }
    }
}

/// Runtime knobs the engine needs from the configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub encoder: EncoderConfig,
    pub supervisor: SupervisorConfig,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encoder: config.encoder.clone(),
            supervisor: config.supervisor.clone(),
        }
    }
}

/// State shared by the engine and every supervision task.
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) registry: StreamRegistry,
    pub(crate) events: EventBus,
    pub(crate) launcher: Arc<dyn EncoderLauncher>,
    pub(crate) settings: EngineSettings,
    closed: AtomicBool,
}

impl EngineShared {
    /// Audit failures are logged and otherwise ignored.
    pub(crate) fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry) {
            tracing::warn!(stream_id = %entry.stream_id, error = %e, "failed to append audit entry");
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StreamStore>,
        launcher: Arc<dyn EncoderLauncher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                store,
                registry: StreamRegistry::new(),
                events: EventBus::default(),
                launcher,
                settings,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.shared.store
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Start a stream from the top of its playlist.
    ///
    /// Returns once the first encoder is running; the rest of the run happens
    /// on a background task.
    pub async fn start_stream(&self, stream_id: &str) -> Result<(), EngineError> {
        self.start(stream_id, None).await
    }

    /// Start a stream so that its first video is the playlist entry at `index`.
    pub async fn start_stream_at(&self, stream_id: &str, index: usize) -> Result<(), EngineError> {
        self.start(stream_id, Some(index)).await
    }

    async fn start(&self, stream_id: &str, resume_at: Option<usize>) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let stream = self
            .shared
            .store
            .stream(stream_id)?
            .ok_or_else(|| EngineError::NotFound(stream_id.to_string()))?;
        if !stream.enabled {
            return Err(EngineError::Disabled(stream_id.to_string()));
        }

        let handle = self
            .shared
            .registry
            .try_reserve(stream_id)
            .map_err(|_| EngineError::AlreadyRunning(stream_id.to_string()))?;

        let result = if self.is_shutting_down() {
            Err(EngineError::ShuttingDown)
        } else {
            self.launch_reserved(&handle, resume_at)
        };

        if let Err(e) = &result {
            tracing::warn!(stream_id, error = %e, "failed to start stream");
            self.shared.registry.release(&handle);
            handle.mark_finished();
        }
        result
    }

    /// Launch under a held reservation. The record is read again here since a
    /// delete may have completed between the first lookup and the reservation.
    fn launch_reserved(
        &self,
        handle: &Arc<StreamHandle>,
        resume_at: Option<usize>,
    ) -> Result<(), EngineError> {
        let stream_id = handle.stream_id();
        let stream = self
            .shared
            .store
            .stream(stream_id)?
            .ok_or_else(|| EngineError::NotFound(stream_id.to_string()))?;
        let playlist = self.shared.store.playlist(stream_id)?;
        if playlist.is_empty() {
            return Err(EngineError::EmptyPlaylist(stream_id.to_string()));
        }
        supervisor::launch(self.shared.clone(), handle.clone(), stream, playlist, resume_at)
    }

    /// Stop a live stream and wait until its encoder is gone and its state
    /// is cleared.
    pub async fn stop_stream(&self, stream_id: &str) -> Result<(), EngineError> {
        let Some(handle) = self.shared.registry.get(stream_id) else {
            return match self.shared.store.stream(stream_id)? {
                Some(_) => Err(EngineError::NotRunning(stream_id.to_string())),
                None => Err(EngineError::NotFound(stream_id.to_string())),
            };
        };

        tracing::info!(stream_id, "stopping stream");
        handle.request_stop(StopReason::Requested);
        handle.wait_finished().await;
        Ok(())
    }

    /// Ids of every stream with a live supervision loop.
    pub fn active_stream_ids(&self) -> BTreeSet<String> {
        self.shared.registry.active_ids()
    }

    pub fn live_streams(&self) -> Vec<LiveStatus> {
        self.shared.registry.snapshot()
    }

    pub fn is_live(&self, stream_id: &str) -> bool {
        self.shared.registry.contains(stream_id)
    }

    /// Delete a stream record, stopping it first if it is live.
    ///
    /// The registry slot is held while the record goes away, so a start that
    /// races the delete sees `AlreadyRunning` and then `NotFound`.
    pub async fn delete_stream(&self, stream_id: &str) -> Result<Stream, EngineError> {
        let slot = loop {
            match self.shared.registry.try_reserve(stream_id) {
                Ok(slot) => break slot,
                Err(_) => {
                    if let Some(live) = self.shared.registry.get(stream_id) {
                        live.request_stop(StopReason::Requested);
                        live.wait_finished().await;
                    }
                }
            }
        };

        let result = match self.shared.store.delete_stream(stream_id) {
            Ok(stream) => {
                tracing::info!(stream_id, "stream deleted");
                Ok(stream)
            }
            Err(StoreError::StreamNotFound(_)) => Err(EngineError::NotFound(stream_id.to_string())),
            Err(e) => Err(e.into()),
        };

        self.shared.registry.release(&slot);
        slot.mark_finished();
        result
    }

    /// Resume every stream persisted as streaming.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        recovery::recover_streams(self).await
    }

    /// Stop every live stream without clearing persisted state, and refuse
    /// new starts from here on.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        let handles = self.shared.registry.handles();
        if handles.is_empty() {
            return;
        }
        tracing::info!(streams = handles.len(), "suspending live streams for shutdown");
        for handle in &handles {
            handle.request_stop(StopReason::Shutdown);
        }
        for handle in handles {
            handle.wait_finished().await;
        }
    }
}
