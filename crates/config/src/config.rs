//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholder replaced with the video file path in encoder arguments
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder replaced with the ingest URL in encoder arguments
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Semantically invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Encoder process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (default "ffmpeg")
    #[serde(default = "default_encoder_program")]
    pub program: String,
    /// Argument template; `{input}` and `{output}` are substituted per video
    #[serde(default = "default_encoder_args")]
    pub args: Vec<String>,
    /// Time to wait after a graceful quit request before killing (default 5000)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}

fn default_encoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-re",
        "-i",
        INPUT_PLACEHOLDER,
        "-c:v",
        "copy",
        "-c:a",
        "aac",
        "-f",
        "flv",
        OUTPUT_PLACEHOLDER,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stop_grace_ms() -> u64 {
    5000
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            args: default_encoder_args(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl EncoderConfig {
    /// Grace period between a stop request and a forced kill
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Supervision loop policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Consecutive respawns of a crashed video before the run fails (default 0)
    #[serde(default)]
    pub crash_retries: u32,
    /// Delay before a crash respawn (default 2000)
    #[serde(default = "default_crash_retry_delay_ms")]
    pub crash_retry_delay_ms: u64,
}

fn default_crash_retry_delay_ms() -> u64 {
    2000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            crash_retries: 0,
            crash_retry_delay_ms: default_crash_retry_delay_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn crash_retry_delay(&self) -> Duration {
        Duration::from_millis(self.crash_retry_delay_ms)
    }
}

/// Startup recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Resume streams that were live before the last shutdown (default true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay before the recovery pass runs (default 5000)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_settle_delay_ms() -> u64 {
    5000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl RecoveryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Persistent state location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding library.json and audit.log
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./restream-state")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// Metadata probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Probe executable (default "ffprobe")
    #[serde(default = "default_probe_program")]
    pub program: String,
}

fn default_probe_program() -> String {
    "ffprobe".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: default_probe_program(),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default 127.0.0.1:7878)
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RESTREAM_ENCODER_PROGRAM -> encoder.program
    /// - RESTREAM_STOP_GRACE_MS -> encoder.stop_grace_ms
    /// - RESTREAM_CRASH_RETRIES -> supervisor.crash_retries
    /// - RESTREAM_RECOVERY_ENABLED -> recovery.enabled
    /// - RESTREAM_SETTLE_DELAY_MS -> recovery.settle_delay_ms
    /// - RESTREAM_STATE_DIR -> storage.state_dir
    /// - RESTREAM_PROBE_PROGRAM -> probe.program
    /// - RESTREAM_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RESTREAM_ENCODER_PROGRAM") {
            if !val.trim().is_empty() {
                self.encoder.program = val;
            }
        }

        if let Ok(val) = env::var("RESTREAM_STOP_GRACE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.encoder.stop_grace_ms = ms;
            }
        }

        if let Ok(val) = env::var("RESTREAM_CRASH_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.supervisor.crash_retries = retries;
            }
        }

        if let Ok(val) = env::var("RESTREAM_RECOVERY_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.recovery.enabled = true,
                "false" | "0" | "no" => self.recovery.enabled = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("RESTREAM_SETTLE_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.recovery.settle_delay_ms = ms;
            }
        }

        if let Ok(val) = env::var("RESTREAM_STATE_DIR") {
            if !val.trim().is_empty() {
                self.storage.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RESTREAM_PROBE_PROGRAM") {
            if !val.trim().is_empty() {
                self.probe.program = val;
            }
        }

        if let Ok(val) = env::var("RESTREAM_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.program.trim().is_empty() {
            return Err(ConfigError::Invalid("encoder.program is empty".to_string()));
        }
        for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
            if !self.encoder.args.iter().any(|a| a.contains(placeholder)) {
                return Err(ConfigError::Invalid(format!(
                    "encoder.args must contain {}",
                    placeholder
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
