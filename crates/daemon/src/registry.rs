//! Stream registry module for restream
//!
//! Process-wide table of live streams. Reserving a slot is the only way to
//! start a stream and releasing it is the last step of every supervision run,
//! so the table's lock is the single serialization point for start/stop.

use crate::events::StopReason;
use crate::store::current_timestamp_ms;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stream {0} already has a live process")]
    AlreadyRegistered(String),
}

/// Lifecycle phase of a live stream. Idle streams have no registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Starting,
    Streaming,
    Stopping,
}

/// Read-only view of one live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub stream_id: String,
    pub phase: StreamPhase,
    /// Traversal position of the current video
    pub position: Option<usize>,
    pub video_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at_ms: i64,
}

/// Runtime binding between a stream id and its supervision loop.
#[derive(Debug)]
pub struct StreamHandle {
    stream_id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
    stop_reason: Mutex<Option<StopReason>>,
    status: RwLock<LiveStatus>,
}

impl StreamHandle {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            stop_reason: Mutex::new(None),
            status: RwLock::new(LiveStatus {
                stream_id: stream_id.to_string(),
                phase: StreamPhase::Starting,
                position: None,
                video_id: None,
                pid: None,
                started_at_ms: current_timestamp_ms(),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Ask the supervision loop to stop. The first reason wins.
    pub fn request_stop(&self, reason: StopReason) {
        {
            let mut slot = self.stop_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.status.write().phase = StreamPhase::Stopping;
        self.cancel.cancel();
    }

    pub fn stop_reason(&self) -> StopReason {
        let reason = *self.stop_reason.lock();
        reason.unwrap_or(StopReason::Requested)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Signal that the run is over and the registry entry is gone.
    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    /// Resolves once the supervision run has fully cleaned up.
    pub async fn wait_finished(&self) {
        self.finished.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub(crate) fn set_playing(&self, position: usize, video_id: &str, pid: Option<u32>) {
        let mut status = self.status.write();
        if status.phase != StreamPhase::Stopping {
            status.phase = StreamPhase::Streaming;
        }
        status.position = Some(position);
        status.video_id = Some(video_id.to_string());
        status.pid = pid;
    }

    pub fn status(&self) -> LiveStatus {
        self.status.read().clone()
    }
}

/// Table of live streams, constructed once and passed down explicitly.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    slots: Mutex<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh handle unless the stream already has one.
    pub fn try_reserve(&self, stream_id: &str) -> Result<Arc<StreamHandle>, RegistryError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(stream_id) {
            return Err(RegistryError::AlreadyRegistered(stream_id.to_string()));
        }
        let handle = Arc::new(StreamHandle::new(stream_id));
        slots.insert(stream_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Remove `handle` if it is still the registered one for its stream.
    pub fn release(&self, handle: &Arc<StreamHandle>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(handle.stream_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                slots.remove(handle.stream_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamHandle>> {
        self.slots.lock().get(stream_id).cloned()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.slots.lock().contains_key(stream_id)
    }

    pub fn active_ids(&self) -> BTreeSet<String> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn handles(&self) -> Vec<Arc<StreamHandle>> {
        self.slots.lock().values().cloned().collect()
    }

    /// Status of every live stream, sorted by id.
    pub fn snapshot(&self) -> Vec<LiveStatus> {
        let mut statuses: Vec<LiveStatus> = self.handles().iter().map(|h| h.status()).collect();
        statuses.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
