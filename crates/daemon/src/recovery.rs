//! Recovery module for restream
//!
//! After a restart, streams persisted as streaming have no process behind
//! them. The recovery pass resumes each one at the video it was playing, or
//! resets it when that is no longer possible.

use crate::engine::{Engine, EngineError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why one stream could not be resumed.
#[derive(Debug, Error)]
pub enum RecoveryFailure {
    #[error("playlist is empty")]
    EmptyPlaylist,

    #[error("no current video was recorded")]
    NoCurrentVideo,

    #[error("video {0} is no longer in the playlist")]
    StaleVideo(String),

    #[error("{0}")]
    Start(#[from] EngineError),
}

/// Outcome of one recovery pass.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Streams that are live again
    pub recovered: Vec<String>,
    /// Streams that were reset, with the reason
    pub failed: Vec<(String, String)>,
    /// Streams that were already live when the pass reached them
    pub skipped: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Resume every stream persisted as streaming.
///
/// Failures are per stream; only failing to list the streams at all aborts
/// the pass.
pub async fn recover_streams(engine: &Engine) -> Result<RecoveryReport, EngineError> {
    let candidates = engine.store().streaming_streams()?;
    let mut report = RecoveryReport::default();

    if candidates.is_empty() {
        tracing::info!("no streams to recover");
        return Ok(report);
    }
    tracing::info!(streams = candidates.len(), "recovering streams");

    for stream in candidates {
        if engine.is_live(&stream.id) {
            tracing::debug!(stream_id = %stream.id, "stream already live, skipping recovery");
            report.skipped.push(stream.id);
            continue;
        }

        match recover_one(engine, &stream.id, stream.current_video.as_deref()).await {
            Ok(index) => {
                tracing::info!(
                    stream_id = %stream.id,
                    video_id = stream.current_video.as_deref().unwrap_or_default(),
                    index,
                    "stream recovered"
                );
                report.recovered.push(stream.id);
            }
            Err(RecoveryFailure::Start(EngineError::AlreadyRunning(_))) => {
                // Someone started it between our check and the reservation
                report.skipped.push(stream.id);
            }
            Err(failure) => {
                tracing::warn!(stream_id = %stream.id, reason = %failure, "stream recovery failed, resetting");
                if let Err(e) = engine.store().set_streaming_state(&stream.id, None) {
                    tracing::error!(stream_id = %stream.id, error = %e, "failed to reset streaming state");
                }
                report.failed.push((stream.id, failure.to_string()));
            }
        }
    }

    tracing::info!(
        recovered = report.recovered.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "recovery pass complete"
    );
    Ok(report)
}

async fn recover_one(
    engine: &Engine,
    stream_id: &str,
    current_video: Option<&str>,
) -> Result<usize, RecoveryFailure> {
    let playlist = engine.store().playlist(stream_id).map_err(EngineError::from)?;
    if playlist.is_empty() {
        return Err(RecoveryFailure::EmptyPlaylist);
    }
    let video_id = current_video.ok_or(RecoveryFailure::NoCurrentVideo)?;
    let index = playlist
        .iter()
        .position(|v| v.id == video_id)
        .ok_or_else(|| RecoveryFailure::StaleVideo(video_id.to_string()))?;

    engine.start_stream_at(stream_id, index).await?;
    Ok(index)
}

/// Wait `settle_delay`, then run one recovery pass unless the engine is
/// already shutting down.
pub async fn run_recovery(engine: Engine, settle_delay: Duration) -> Option<RecoveryReport> {
    if !settle_delay.is_zero() {
        tracing::debug!(delay_ms = settle_delay.as_millis() as u64, "waiting before recovery");
        tokio::time::sleep(settle_delay).await;
    }
    if engine.is_shutting_down() {
        return None;
    }
    match engine.recover().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "recovery pass failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEvent;
    use crate::model::PlaybackMode;
    use crate::store::{LibraryStore, StreamStore};
    use crate::test_support::*;
    use std::sync::Arc;

    fn engine_with(store: &Arc<LibraryStore>) -> (Engine, Arc<ScriptLauncher>) {
        let launcher = Arc::new(ScriptLauncher::new(WAIT_FOR_QUIT));
        let engine = test_engine(store, &launcher, test_settings());
        (engine, launcher)
    }

    #[tokio::test]
    async fn test_resumes_at_recorded_video() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "s1", PlaybackMode::Loop, &["v1", "v2", "v3"]);
        store.set_streaming_state("s1", Some("v2")).unwrap();
        let (engine, launcher) = engine_with(&store);
        let mut rx = engine.subscribe();

        let report = engine.recover().await.unwrap();
        assert_eq!(report.recovered, vec!["s1"]);
        assert!(report.is_clean());

        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Started {
                stream_id: "s1".to_string(),
                video_id: "v2".to_string(),
            }
        );
        assert_eq!(launcher.launches(), vec!["v2"]);
        assert_eq!(
            store.stream("s1").unwrap().unwrap().current_video.as_deref(),
            Some("v2")
        );

        engine.stop_stream("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_resumed_once_continues_in_stored_order() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "s1", PlaybackMode::Once, &["v1", "v2", "v3"]);
        store.set_streaming_state("s1", Some("v2")).unwrap();
        let launcher = Arc::new(ScriptLauncher::new(QUICK));
        let engine = test_engine(&store, &launcher, test_settings());
        let mut rx = engine.subscribe();

        engine.recover().await.unwrap();
        wait_for_event(&mut rx, |e| matches!(e, StreamEvent::Stopped { .. })).await;
        assert_eq!(launcher.launches(), vec!["v2", "v3"]);
    }

    #[tokio::test]
    async fn test_stale_stream_fails_alone() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "healthy", PlaybackMode::Loop, &["v1", "v2"]);
        seed_stream(&store, "stale", PlaybackMode::Loop, &["v1", "v2"]);
        store.set_streaming_state("healthy", Some("v1")).unwrap();
        store.set_streaming_state("stale", Some("gone")).unwrap();
        let (engine, _launcher) = engine_with(&store);

        let report = engine.recover().await.unwrap();
        assert_eq!(report.recovered, vec!["healthy"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "stale");
        assert!(report.failed[0].1.contains("gone"));

        let stale = store.stream("stale").unwrap().unwrap();
        assert!(!stale.is_streaming);
        assert_eq!(stale.current_video, None);
        assert!(engine.is_live("healthy"));
        assert!(!engine.is_live("stale"));

        engine.stop_stream("healthy").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_playlist_and_missing_current_video_are_reset() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "empty", PlaybackMode::Loop, &[]);
        store.set_streaming_state("empty", Some("v1")).unwrap();
        seed_stream(&store, "blank", PlaybackMode::Loop, &["v1"]);
        store
            .upsert_stream({
                let mut s = store.stream("blank").unwrap().unwrap();
                s.is_streaming = true;
                s.current_video = None;
                s
            })
            .unwrap();
        let (engine, launcher) = engine_with(&store);

        let report = engine.recover().await.unwrap();
        assert!(report.recovered.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(store.streaming_streams().unwrap().is_empty());
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_live_stream_is_skipped() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "s1", PlaybackMode::Loop, &["v1"]);
        let (engine, launcher) = engine_with(&store);
        engine.start_stream("s1").await.unwrap();

        let report = engine.recover().await.unwrap();
        assert_eq!(report.skipped, vec!["s1"]);
        assert_eq!(launcher.launch_count(), 1);
        // State of the live run is left alone
        assert!(store.stream("s1").unwrap().unwrap().is_streaming);

        engine.stop_stream("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_run_recovery_skips_after_shutdown() {
        let store = Arc::new(LibraryStore::in_memory());
        seed_stream(&store, "s1", PlaybackMode::Loop, &["v1"]);
        store.set_streaming_state("s1", Some("v1")).unwrap();
        let (engine, launcher) = engine_with(&store);

        engine.shutdown().await;
        assert!(run_recovery(engine, Duration::ZERO).await.is_none());
        assert_eq!(launcher.launch_count(), 0);
        assert!(store.stream("s1").unwrap().unwrap().is_streaming);
    }
}
