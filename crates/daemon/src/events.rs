//! Lifecycle events emitted by the engine.
//!
//! Events go out on a tokio broadcast channel. Whatever fans them out to
//! remote subscribers lives outside this crate and simply subscribes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a supervision loop ended without a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator asked for the stop.
    Requested,
    /// ONCE / SHUFFLE playlist ran out.
    PlaylistFinished,
    /// The service is shutting down; persisted state is kept for recovery.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StreamEvent {
    #[serde(rename = "stream:started")]
    Started { stream_id: String, video_id: String },
    #[serde(rename = "stream:stopped")]
    Stopped { stream_id: String, reason: StopReason },
    #[serde(rename = "stream:advanced")]
    Advanced {
        stream_id: String,
        video_id: String,
        position: usize,
    },
    #[serde(rename = "stream:failed")]
    Failed {
        stream_id: String,
        video_id: Option<String>,
        reason: String,
    },
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Started { .. } => "stream:started",
            StreamEvent::Stopped { .. } => "stream:stopped",
            StreamEvent::Advanced { .. } => "stream:advanced",
            StreamEvent::Failed { .. } => "stream:failed",
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Started { stream_id, .. }
            | StreamEvent::Stopped { stream_id, .. }
            | StreamEvent::Advanced { stream_id, .. }
            | StreamEvent::Failed { stream_id, .. } => stream_id,
        }
    }

    pub fn video_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Started { video_id, .. } | StreamEvent::Advanced { video_id, .. } => {
                Some(video_id)
            }
            StreamEvent::Failed { video_id, .. } => video_id.as_deref(),
            StreamEvent::Stopped { .. } => None,
        }
    }
}

/// Explicitly constructed event hub, one per engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: StreamEvent) {
        tracing::debug!(event = event.name(), stream_id = event.stream_id(), "emitting event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Log every event until the bus closes.
pub async fn log_events(mut rx: broadcast::Receiver<StreamEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                StreamEvent::Failed { reason, .. } => tracing::warn!(
                    event = event.name(),
                    stream_id = event.stream_id(),
                    video_id = event.video_id(),
                    reason = %reason,
                    "stream event"
                ),
                _ => tracing::info!(
                    event = event.name(),
                    stream_id = event.stream_id(),
                    video_id = event.video_id(),
                    "stream event"
                ),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
