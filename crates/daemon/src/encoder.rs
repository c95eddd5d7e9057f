//! Encoder process module for restream
//!
//! Builds the encoder command line for one video and owns the spawn and
//! termination primitives the supervisor uses.

use restream_config::{EncoderConfig, INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Sent on stdin to ask the encoder to finish its output cleanly
const QUIT_SEQUENCE: &[u8] = b"q\n";

/// Error type for spawning an encoder process
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The OS refused to start the process
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A fully substituted encoder invocation for one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Video fed to this invocation
    pub input: PathBuf,
    /// Ingest URL this invocation pushes to
    pub output: String,
}

impl EncoderCommand {
    /// Substitute `{input}` and `{output}` in the configured argument template.
    pub fn build(cfg: &EncoderConfig, input: &Path, output: &str) -> Self {
        let input_str = input.to_string_lossy();
        let args = cfg
            .args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &input_str)
                    .replace(OUTPUT_PLACEHOLDER, output)
            })
            .collect();

        Self {
            program: cfg.program.clone(),
            args,
            input: input.to_path_buf(),
            output: output.to_string(),
        }
    }

    /// A tokio command with stdin piped for the quit sequence.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Process execution interface consumed by the supervisor.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, command: &EncoderCommand) -> Result<Child, SpawnError>;
}

/// Launches real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl EncoderLauncher for ProcessLauncher {
    fn launch(&self, command: &EncoderCommand) -> Result<Child, SpawnError> {
        command.to_command().spawn().map_err(|source| SpawnError::Io {
            program: command.program.clone(),
            source,
        })
    }
}

/// How an encoder run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The encoder reached the end of its input
    Completed,
    /// Non-zero exit code
    Failed(i32),
    /// Killed by a signal
    Signaled,
}

impl ExitKind {
    pub fn classify(status: ExitStatus) -> Self {
        if status.success() {
            ExitKind::Completed
        } else {
            match status.code() {
                Some(code) => ExitKind::Failed(code),
                None => ExitKind::Signaled,
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitKind::Completed => "completed".to_string(),
            ExitKind::Failed(code) => format!("encoder exited with code {}", code),
            ExitKind::Signaled => "encoder was terminated by a signal".to_string(),
        }
    }
}

/// Stop an encoder: quit request, bounded wait, then kill and reap.
///
/// Always leaves the child reaped, whichever branch ends it.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(mut stdin) = child.stdin.take() {
        // The encoder may already be gone; a broken pipe is fine here
        let _ = stdin.write_all(QUIT_SEQUENCE).await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                grace_ms = grace.as_millis() as u64,
                "encoder ignored quit request, killing"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config() -> EncoderConfig {
        EncoderConfig::default()
    }

    #[test]
    fn test_build_substitutes_placeholders() {
        let cmd = EncoderCommand::build(
            &config(),
            Path::new("/media/intro.mp4"),
            "rtmp://live.example/app/key",
        );

        assert_eq!(cmd.program, "ffmpeg");
        let i = cmd.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(cmd.args[i + 1], "/media/intro.mp4");
        assert_eq!(cmd.args.last().unwrap(), "rtmp://live.example/app/key");
        assert!(!cmd.args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_build_substitutes_inside_larger_arguments() {
        let cfg = EncoderConfig {
            program: "encoder".to_string(),
            args: vec!["--in={input}".to_string(), "--out={output}".to_string()],
            stop_grace_ms: 10,
        };
        let cmd = EncoderCommand::build(&cfg, Path::new("/a b/c.mkv"), "srt://host:9000");
        assert_eq!(cmd.args, vec!["--in=/a b/c.mkv", "--out=srt://host:9000"]);
    }

    #[test]
    fn test_to_command_keeps_program_and_args() {
        let cmd = EncoderCommand::build(&config(), Path::new("/v.mp4"), "rtmp://x/y");
        let command = cmd.to_command();
        let std_cmd = command.as_std();
        assert_eq!(std_cmd.get_program(), "ffmpeg");
        assert_eq!(std_cmd.get_args().count(), cmd.args.len());
    }

    #[tokio::test]
    async fn test_launch_missing_program_is_spawn_error() {
        let cmd = EncoderCommand {
            program: "/nonexistent/restream-encoder".to_string(),
            args: vec![],
            input: PathBuf::from("/v.mp4"),
            output: "rtmp://x".to_string(),
        };
        let err = ProcessLauncher.launch(&cmd).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/restream-encoder"));
    }

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("sh should spawn")
    }

    #[tokio::test]
    async fn test_terminate_graceful_quit() {
        let mut child = sh("read -r _; exit 0");
        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ExitKind::classify(status), ExitKind::Completed);
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let mut child = sh("trap '' TERM; sleep 30");
        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(ExitKind::classify(status), ExitKind::Signaled);
    }

    #[tokio::test]
    async fn test_classify_failure_code() {
        let mut child = sh("exit 3");
        let status = child.wait().await.unwrap();
        assert_eq!(ExitKind::classify(status), ExitKind::Failed(3));
        assert!(ExitKind::Failed(3).describe().contains('3'));
    }
}
