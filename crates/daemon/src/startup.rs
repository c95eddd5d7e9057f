//! Startup checks module for restream
//!
//! Preflight checks run before the daemon starts accepting work:
//! - Encoder binary answers `-version` (fatal)
//! - Probe binary answers `-version` (warning only, probing degrades)
//! - Encoder argument template carries both placeholders

use crate::config::{Config, INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Invalid encoder arguments: {0}")]
    InvalidTemplate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse the version token out of `<tool> -version` output.
///
/// Handles the usual ffmpeg/ffprobe formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed git builds: "ffmpeg version n7.1-... ..."
pub fn parse_tool_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;

    let lower = version_line.to_lowercase();
    let version = lower
        .split(" version ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_start_matches('n')
        .to_string();

    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Run `<program> -version`, returning the parsed version if there is one.
fn query_version(program: &str) -> Result<Option<String>, String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            )
        })?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", program, output.status));
    }

    Ok(parse_tool_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Check the encoder binary is runnable.
pub fn check_encoder_available(program: &str) -> Result<(), StartupError> {
    let version = query_version(program).map_err(StartupError::EncoderUnavailable)?;
    tracing::info!(
        program,
        version = version.as_deref().unwrap_or("unknown"),
        "encoder available"
    );
    Ok(())
}

/// Check the probe binary; a missing probe only degrades metadata.
pub fn check_probe_available(program: &str) -> bool {
    match query_version(program) {
        Ok(version) => {
            tracing::info!(
                program,
                version = version.as_deref().unwrap_or("unknown"),
                "probe available"
            );
            true
        }
        Err(reason) => {
            tracing::warn!(program, reason = %reason, "probe unavailable, video metadata will be empty");
            false
        }
    }
}

/// Both placeholders must appear somewhere in the argument template.
pub fn check_args_template(args: &[String]) -> Result<(), StartupError> {
    for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
        if !args.iter().any(|arg| arg.contains(placeholder)) {
            return Err(StartupError::InvalidTemplate(format!(
                "encoder args must contain {}",
                placeholder
            )));
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Argument template
/// 2. Encoder availability
/// 3. Probe availability (never fails)
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_args_template(&cfg.encoder.args)?;
    check_encoder_available(&cfg.encoder.program)?;
    check_probe_available(&cfg.probe.program);
    Ok(())
}
