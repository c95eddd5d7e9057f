//! Shared fixtures for the engine, recovery and server tests.

use crate::encoder::{EncoderCommand, EncoderLauncher, SpawnError};
use crate::engine::{Engine, EngineSettings};
use crate::events::StreamEvent;
use crate::model::{PlaybackMode, Stream, Video, VideoMetadata};
use crate::store::LibraryStore;
use parking_lot::Mutex;
use restream_config::{EncoderConfig, SupervisorConfig};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// Runs until it receives the quit sequence.
pub(crate) const WAIT_FOR_QUIT: &str = "read -r _; exit 0";
/// Finishes its "video" immediately.
pub(crate) const QUICK: &str = "exit 0";
pub(crate) const CRASH: &str = "exit 3";
/// Ignores the quit sequence and SIGTERM.
pub(crate) const STUBBORN: &str = "trap '' TERM; sleep 30";
/// Not a script: makes the launcher refuse to spawn.
pub(crate) const SPAWN_ERROR: &str = "!spawn-error";

/// Launches `sh -c <script>` where the script is picked by the input video.
pub(crate) struct ScriptLauncher {
    default_script: String,
    scripts: HashMap<PathBuf, String>,
    launches: Mutex<Vec<PathBuf>>,
}

impl ScriptLauncher {
    pub(crate) fn new(default_script: &str) -> Self {
        Self {
            default_script: default_script.to_string(),
            scripts: HashMap::new(),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with(mut self, video_id: &str, script: &str) -> Self {
        self.scripts.insert(video_path(video_id), script.to_string());
        self
    }

    /// Video ids of every successful launch, in order.
    pub(crate) fn launches(&self) -> Vec<String> {
        self.launches
            .lock()
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }

    pub(crate) fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }
}

impl EncoderLauncher for ScriptLauncher {
    fn launch(&self, command: &EncoderCommand) -> Result<Child, SpawnError> {
        let script = self
            .scripts
            .get(&command.input)
            .unwrap_or(&self.default_script);
        if script == SPAWN_ERROR {
            return Err(SpawnError::Io {
                program: "sh".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "simulated spawn failure"),
            });
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io {
                program: "sh".to_string(),
                source,
            })?;
        self.launches.lock().push(command.input.clone());
        Ok(child)
    }
}

pub(crate) fn video_path(id: &str) -> PathBuf {
    PathBuf::from(format!("/media/{}.mp4", id))
}

pub(crate) fn test_video(id: &str) -> Video {
    Video {
        id: id.to_string(),
        owner_id: "u1".to_string(),
        path: video_path(id),
        size_bytes: 1024,
        metadata: VideoMetadata::default(),
    }
}

pub(crate) fn test_stream(id: &str, mode: PlaybackMode) -> Stream {
    let mut stream = Stream::new("u1", "rtmp://ingest.example/live", id, mode);
    stream.id = id.to_string();
    stream
}

/// Insert a stream whose playlist holds `videos` in order.
pub(crate) fn seed_stream(store: &LibraryStore, id: &str, mode: PlaybackMode, videos: &[&str]) {
    store.upsert_stream(test_stream(id, mode)).unwrap();
    for video_id in videos {
        if store.video(video_id).is_none() {
            store.add_video(test_video(video_id)).unwrap();
        }
        store.append_to_playlist(id, video_id).unwrap();
    }
}

pub(crate) fn test_settings() -> EngineSettings {
    EngineSettings {
        encoder: EncoderConfig {
            stop_grace_ms: 2000,
            ..EncoderConfig::default()
        },
        supervisor: SupervisorConfig {
            crash_retries: 0,
            crash_retry_delay_ms: 10,
        },
    }
}

pub(crate) fn test_engine(
    store: &Arc<LibraryStore>,
    launcher: &Arc<ScriptLauncher>,
    settings: EngineSettings,
) -> Engine {
    Engine::new(store.clone(), launcher.clone(), settings)
}

pub(crate) async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Skip events until one matches.
pub(crate) async fn wait_for_event(
    rx: &mut broadcast::Receiver<StreamEvent>,
    pred: impl Fn(&StreamEvent) -> bool,
) -> StreamEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
