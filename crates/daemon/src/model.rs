//! Persisted records: streams, videos and playlist entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Traversal policy for a stream's playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Play start to finish, then stop.
    Once,
    /// Repeat the stored order indefinitely.
    Loop,
    /// Play one random permutation, then stop.
    Shuffle,
    /// Repeat with a fresh random permutation every cycle.
    ShuffleLoop,
}

impl PlaybackMode {
    pub fn is_shuffled(self) -> bool {
        matches!(self, PlaybackMode::Shuffle | PlaybackMode::ShuffleLoop)
    }

    pub fn repeats(self) -> bool {
        matches!(self, PlaybackMode::Loop | PlaybackMode::ShuffleLoop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackMode::Once => "once",
            PlaybackMode::Loop => "loop",
            PlaybackMode::Shuffle => "shuffle",
            PlaybackMode::ShuffleLoop => "shuffle_loop",
        }
    }
}

impl Default for PlaybackMode {
    fn default() -> Self {
        Self::Once
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "once" => Ok(PlaybackMode::Once),
            "loop" => Ok(PlaybackMode::Loop),
            "shuffle" => Ok(PlaybackMode::Shuffle),
            "shuffle_loop" => Ok(PlaybackMode::ShuffleLoop),
            other => Err(format!("unknown playback mode '{}'", other)),
        }
    }
}

/// One outbound relay target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    pub owner_id: String,
    /// Ingest endpoint without the key, e.g. `rtmp://live.example.com/app`.
    pub destination_url: String,
    pub stream_key: String,
    /// Administrative switch; disabled streams cannot be started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: PlaybackMode,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub current_video: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Stream {
    pub fn new(
        owner_id: &str,
        destination_url: &str,
        stream_key: &str,
        mode: PlaybackMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            destination_url: destination_url.to_string(),
            stream_key: stream_key.to_string(),
            enabled: true,
            mode,
            is_streaming: false,
            current_video: None,
        }
    }

    /// Full ingest URL handed to the encoder: destination and key joined by one `/`.
    pub fn ingest_url(&self) -> String {
        let base = self.destination_url.trim_end_matches('/');
        let key = self.stream_key.trim_start_matches('/');
        if key.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, key)
        }
    }
}

/// Probed media details. Every field is absent when probing failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoMetadata {
    pub duration_secs: Option<u64>,
    /// `WIDTHxHEIGHT` of the first video sub-stream.
    pub resolution: Option<String>,
    /// Container label taken from the file extension.
    pub format: Option<String>,
}

impl VideoMetadata {
    pub fn is_empty(&self) -> bool {
        self.duration_secs.is_none() && self.resolution.is_none() && self.format.is_none()
    }
}

/// A media file owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: String,
    pub owner_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: VideoMetadata,
}

impl Video {
    pub fn new(owner_id: &str, path: PathBuf, size_bytes: u64, metadata: VideoMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            path,
            size_bytes,
            metadata,
        }
    }
}

/// Position of a video within one stream's playlist. Orders are zero-based and dense.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub stream_id: String,
    pub video_id: String,
    pub order: usize,
}
