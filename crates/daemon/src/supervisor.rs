//! Process supervisor module for restream
//!
//! One supervisor per live stream. It owns the encoder child for the whole
//! run, waits on either the child's exit or a stop request, and decides
//! whether to advance the playlist, stop, or report a failure.

use crate::encoder::{self, EncoderCommand, ExitKind};
use crate::engine::{EngineError, EngineShared};
use crate::events::{StopReason, StreamEvent};
use crate::model::{Stream, Video};
use crate::playlist::{PlaylistError, Sequencer, Step};
use crate::registry::StreamHandle;
use crate::store::{AuditAction, AuditEntry, StreamStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::process::Child;

/// How a supervision run ended.
#[derive(Debug)]
enum Outcome {
    Stopped(StopReason),
    Finished,
    Crashed { video_id: String, reason: String },
}

pub(crate) struct Supervisor {
    shared: Arc<EngineShared>,
    handle: Arc<StreamHandle>,
    stream: Stream,
    ingest_url: String,
    playlist: Vec<Video>,
    sequencer: Sequencer,
    rng: StdRng,
    child: Child,
    current: usize,
    crash_streak: u32,
}

/// Pick the first video, persist it, spawn the encoder and hand the child to
/// a new supervision task.
///
/// The caller holds the registry reservation in `handle`. On error nothing is
/// left running and the persisted state is idle; releasing the reservation is
/// the caller's job.
pub(crate) fn launch(
    shared: Arc<EngineShared>,
    handle: Arc<StreamHandle>,
    stream: Stream,
    playlist: Vec<Video>,
    resume_at: Option<usize>,
) -> Result<(), EngineError> {
    let mut rng = StdRng::from_entropy();
    let len = playlist.len();
    let mut sequencer = match resume_at {
        Some(index) => Sequencer::starting_at(stream.mode, len, index, &mut rng)?,
        None => Sequencer::new(stream.mode),
    };

    let (index, position) = match sequencer.next(len, &mut rng)? {
        Step::Play { index, position } => (index, position),
        Step::Finished => return Err(EngineError::EmptyPlaylist(stream.id.clone())),
    };
    let video = playlist
        .get(index)
        .ok_or(PlaylistError::OutOfRange { index, len })?;

    shared.store.set_streaming_state(&stream.id, Some(&video.id))?;

    let ingest_url = stream.ingest_url();
    let command = EncoderCommand::build(&shared.settings.encoder, &video.path, &ingest_url);
    let child = match shared.launcher.launch(&command) {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(stream_id = %stream.id, video_id = %video.id, error = %e, "encoder failed to spawn");
            if let Err(clear) = shared.store.set_streaming_state(&stream.id, None) {
                tracing::warn!(stream_id = %stream.id, error = %clear, "failed to reset streaming state");
            }
            shared.audit(
                AuditEntry::new(&stream.id, AuditAction::Fail, Some(&video.id))
                    .with_detail(e.to_string()),
            );
            return Err(e.into());
        }
    };

    let video_id = video.id.clone();
    handle.set_playing(position, &video_id, child.id());
    tracing::info!(
        stream_id = %stream.id,
        video_id = %video_id,
        pid = child.id(),
        mode = %stream.mode,
        resume_at,
        "stream started"
    );
    shared.audit(AuditEntry::new(&stream.id, AuditAction::Start, Some(&video_id)));
    shared.events.emit(StreamEvent::Started {
        stream_id: stream.id.clone(),
        video_id,
    });

    let supervisor = Supervisor {
        shared,
        handle,
        stream,
        ingest_url,
        playlist,
        sequencer,
        rng,
        child,
        current: index,
        crash_streak: 0,
    };
    tokio::spawn(supervisor.run());
    Ok(())
}

impl Supervisor {
    async fn run(mut self) {
        let outcome = self.supervise().await;
        self.finish(outcome).await;
    }

    fn current_video_id(&self) -> String {
        self.playlist
            .get(self.current)
            .map(|v| v.id.clone())
            .unwrap_or_default()
    }

    async fn supervise(&mut self) -> Outcome {
        loop {
            let exit = tokio::select! {
                biased;
                _ = self.handle.cancelled() => None,
                status = self.child.wait() => Some(status),
            };

            let Some(status) = exit else {
                return Outcome::Stopped(self.handle.stop_reason());
            };

            // A stop request wins over whatever the exit code says
            if self.handle.is_cancelled() {
                return Outcome::Stopped(self.handle.stop_reason());
            }

            let kind = match status {
                Ok(status) => ExitKind::classify(status),
                Err(e) => {
                    return Outcome::Crashed {
                        video_id: self.current_video_id(),
                        reason: format!("failed to wait for encoder: {}", e),
                    }
                }
            };

            match kind {
                ExitKind::Completed => {
                    self.crash_streak = 0;
                    if let Some(outcome) = self.advance().await {
                        return outcome;
                    }
                }
                failure => {
                    let video_id = self.current_video_id();
                    let retries = self.shared.settings.supervisor.crash_retries;
                    if self.crash_streak >= retries {
                        return Outcome::Crashed {
                            video_id,
                            reason: failure.describe(),
                        };
                    }

                    self.crash_streak += 1;
                    tracing::warn!(
                        stream_id = %self.stream.id,
                        video_id = %video_id,
                        attempt = self.crash_streak,
                        retries,
                        "{}, respawning",
                        failure.describe()
                    );
                    let retry_delay = self.shared.settings.supervisor.crash_retry_delay();
                    tokio::select! {
                        biased;
                        _ = self.handle.cancelled() => {
                            return Outcome::Stopped(self.handle.stop_reason());
                        }
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                    if let Err(reason) = self.spawn_current() {
                        return Outcome::Crashed { video_id, reason };
                    }
                    let position = self.sequencer.position().unwrap_or(self.current);
                    self.handle.set_playing(position, &video_id, self.child.id());
                }
            }
        }
    }

    /// Move to the next entry. `None` means keep supervising.
    async fn advance(&mut self) -> Option<Outcome> {
        let step = match self.sequencer.next(self.playlist.len(), &mut self.rng) {
            Ok(step) => step,
            Err(e) => {
                return Some(Outcome::Crashed {
                    video_id: self.current_video_id(),
                    reason: e.to_string(),
                })
            }
        };
        let (index, position) = match step {
            Step::Finished => return Some(Outcome::Finished),
            Step::Play { index, position } => (index, position),
        };

        self.current = index;
        let video_id = self.current_video_id();
        persist_state(
            self.shared.store.clone(),
            self.stream.id.clone(),
            Some(video_id.clone()),
        )
        .await;

        if let Err(reason) = self.spawn_current() {
            return Some(Outcome::Crashed { video_id, reason });
        }

        self.handle.set_playing(position, &video_id, self.child.id());
        tracing::info!(
            stream_id = %self.stream.id,
            video_id = %video_id,
            position,
            pid = self.child.id(),
            "advanced to next video"
        );
        self.shared.audit(AuditEntry::new(
            &self.stream.id,
            AuditAction::Advance,
            Some(&video_id),
        ));
        self.shared.events.emit(StreamEvent::Advanced {
            stream_id: self.stream.id.clone(),
            video_id,
            position,
        });
        None
    }

    /// Replace the exited child with a new encoder for the current video.
    fn spawn_current(&mut self) -> Result<(), String> {
        let video = self
            .playlist
            .get(self.current)
            .ok_or_else(|| format!("playlist index {} vanished", self.current))?;
        let command =
            EncoderCommand::build(&self.shared.settings.encoder, &video.path, &self.ingest_url);
        match self.shared.launcher.launch(&command) {
            Ok(child) => {
                self.child = child;
                Ok(())
            }
            Err(e) => Err(format!("spawn failed: {}", e)),
        }
    }

    /// Reap the child, reconcile persisted state, release the registry entry
    /// and announce the outcome, in that order.
    async fn finish(mut self, outcome: Outcome) {
        let stream_id = self.stream.id.clone();

        if matches!(self.child.try_wait(), Ok(None)) {
            let grace = self.shared.settings.encoder.stop_grace();
            match encoder::terminate(&mut self.child, grace).await {
                Ok(status) => {
                    tracing::debug!(stream_id = %stream_id, status = %status, "encoder terminated")
                }
                Err(e) => {
                    tracing::error!(stream_id = %stream_id, error = %e, "failed to terminate encoder")
                }
            }
        }

        let event = match outcome {
            Outcome::Stopped(StopReason::Shutdown) => {
                // Persisted state stays as is so the next startup resumes here
                tracing::info!(stream_id = %stream_id, "stream suspended for shutdown");
                self.shared.audit(
                    AuditEntry::new(&stream_id, AuditAction::Stop, None).with_detail("shutdown"),
                );
                StreamEvent::Stopped {
                    stream_id: stream_id.clone(),
                    reason: StopReason::Shutdown,
                }
            }
            Outcome::Stopped(reason) => {
                persist_state(self.shared.store.clone(), stream_id.clone(), None).await;
                tracing::info!(stream_id = %stream_id, ?reason, "stream stopped");
                self.shared.audit(
                    AuditEntry::new(&stream_id, AuditAction::Stop, None).with_detail("requested"),
                );
                StreamEvent::Stopped {
                    stream_id: stream_id.clone(),
                    reason,
                }
            }
            Outcome::Finished => {
                persist_state(self.shared.store.clone(), stream_id.clone(), None).await;
                tracing::info!(stream_id = %stream_id, "playlist finished");
                self.shared.audit(
                    AuditEntry::new(&stream_id, AuditAction::Stop, None)
                        .with_detail("playlist finished"),
                );
                StreamEvent::Stopped {
                    stream_id: stream_id.clone(),
                    reason: StopReason::PlaylistFinished,
                }
            }
            Outcome::Crashed { video_id, reason } => {
                persist_state(self.shared.store.clone(), stream_id.clone(), None).await;
                tracing::error!(stream_id = %stream_id, video_id = %video_id, reason = %reason, "stream failed");
                self.shared.audit(
                    AuditEntry::new(&stream_id, AuditAction::Fail, Some(&video_id))
                        .with_detail(reason.clone()),
                );
                StreamEvent::Failed {
                    stream_id: stream_id.clone(),
                    video_id: Some(video_id).filter(|id| !id.is_empty()),
                    reason,
                }
            }
        };

        self.shared.registry.release(&self.handle);
        self.shared.events.emit(event);
        self.handle.mark_finished();
    }
}

/// Write the streaming state on the blocking pool. The store rewrites the
/// whole library file under a single lock shared by every stream.
async fn persist_state(
    store: Arc<dyn StreamStore>,
    stream_id: String,
    current_video: Option<String>,
) {
    let result = tokio::task::spawn_blocking({
        let stream_id = stream_id.clone();
        move || store.set_streaming_state(&stream_id, current_video.as_deref())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(stream_id = %stream_id, error = %e, "failed to persist streaming state")
        }
        Err(e) => {
            tracing::error!(stream_id = %stream_id, error = %e, "streaming state write panicked")
        }
    }
}
