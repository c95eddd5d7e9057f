//! Metadata probe module for restream.
//!
//! Runs ffprobe on a video file and condenses its JSON report into the
//! handful of fields stored on a video record. Probing is best effort:
//! callers that only want metadata use [`MetadataProbe::probe`], which never
//! fails.

use crate::model::VideoMetadata;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video sub-stream.
    #[error("no video stream found")]
    NoVideoStream,

    /// IO error during probe (including a missing ffprobe binary).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Wrapper around the ffprobe binary.
#[derive(Debug, Clone)]
pub struct MetadataProbe {
    program: String,
}

impl Default for MetadataProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MetadataProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Probe `path`, degrading to empty metadata on any failure.
    pub fn probe(&self, path: &Path) -> VideoMetadata {
        match self.try_probe(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "metadata probe failed");
                VideoMetadata::default()
            }
        }
    }

    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    pub fn try_probe(&self, path: &Path) -> Result<VideoMetadata, ProbeError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "{} exited with status {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut metadata = parse_ffprobe_output(&stdout)?;
        metadata.format = format_label(path);
        Ok(metadata)
    }
}

/// Parses ffprobe JSON output into duration and resolution.
///
/// The format label comes from the file name, not from ffprobe, so it is
/// left empty here.
pub fn parse_ffprobe_output(json_str: &str) -> Result<VideoMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let resolution = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
        _ => None,
    };

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round() as u64);

    Ok(VideoMetadata {
        duration_secs,
        resolution,
        format: None,
    })
}

/// Lowercased file extension, e.g. `mp4`.
pub fn format_label(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
}
