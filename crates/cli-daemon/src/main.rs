//! CLI entry point for the restream daemon
//!
//! Parses command line arguments, then either runs the daemon or performs a
//! one-shot library operation against the state directory.

use clap::{Parser, Subcommand};
use restream_daemon::{
    delete_video, ingest_video, Config, Daemon, LibraryStore, MetadataProbe, PlaybackMode, Stream,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Restream daemon - relays stored videos to live ingest endpoints
#[derive(Parser, Debug)]
#[command(name = "restreamd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml); defaults apply if it is missing
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Skip startup checks (encoder, probe). For testing only.
        #[arg(long)]
        skip_checks: bool,
    },
    /// Probe a video file and print its metadata
    Probe { path: PathBuf },
    /// Register a video file in the library
    AddVideo {
        #[arg(long)]
        owner: String,
        path: PathBuf,
    },
    /// Remove a video from the library and every playlist
    RemoveVideo {
        id: String,
        /// Delete the file as well
        #[arg(long)]
        delete_file: bool,
    },
    /// Create a stream
    AddStream {
        #[arg(long)]
        owner: String,
        /// Ingest endpoint without the key, e.g. rtmp://live.example.com/app
        #[arg(long)]
        url: String,
        #[arg(long)]
        key: String,
        /// once, loop, shuffle or shuffle-loop
        #[arg(long, default_value = "once")]
        mode: PlaybackMode,
    },
    /// Append a video to a stream's playlist
    Enqueue { stream: String, video: String },
    /// Print the library
    List,
}

fn init_logging(verbose: bool) {
    // Respect RUST_LOG if set, otherwise pick defaults based on the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "restream_daemon=debug,restreamd=debug".to_string()
        } else {
            "restream_daemon=info,restreamd=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn open_store(config: &Config) -> Result<LibraryStore, String> {
    LibraryStore::open(&config.storage.state_dir).map_err(|e| {
        format!(
            "failed to open library at {}: {}",
            config.storage.state_dir.display(),
            e
        )
    })
}

fn run_daemon(config: Config, skip_checks: bool) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    runtime.block_on(async move {
        let daemon = if skip_checks {
            tracing::warn!("skipping startup checks (--skip-checks enabled)");
            let store = open_store(&config)?;
            Daemon::new_without_checks(config, std::sync::Arc::new(store))
        } else {
            Daemon::with_config(config).map_err(|e| format!("failed to initialize daemon: {}", e))?
        };
        daemon.run().await.map_err(|e| e.to_string())
    })
}

fn probe(config: &Config, path: &Path) -> Result<(), String> {
    let probe = MetadataProbe::new(config.probe.program.clone());
    let metadata = probe
        .try_probe(path)
        .map_err(|e| format!("probe failed for {}: {}", path.display(), e))?;
    print_json(&metadata)
}

fn execute(cli: Cli) -> Result<(), String> {
    let config = Config::load_or_default(&cli.config).map_err(|e| e.to_string())?;

    match cli.command.unwrap_or(Command::Run { skip_checks: false }) {
        Command::Run { skip_checks } => run_daemon(config, skip_checks),
        Command::Probe { path } => probe(&config, &path),
        Command::AddVideo { owner, path } => {
            let store = open_store(&config)?;
            let probe = MetadataProbe::new(config.probe.program.clone());
            let video = ingest_video(&store, &probe, &owner, &path).map_err(|e| e.to_string())?;
            print_json(&video)
        }
        Command::RemoveVideo { id, delete_file } => {
            let store = open_store(&config)?;
            let video = delete_video(&store, &id, delete_file).map_err(|e| e.to_string())?;
            print_json(&video)
        }
        Command::AddStream {
            owner,
            url,
            key,
            mode,
        } => {
            let store = open_store(&config)?;
            let stream = Stream::new(&owner, &url, &key, mode);
            store.upsert_stream(stream.clone()).map_err(|e| e.to_string())?;
            print_json(&stream)
        }
        Command::Enqueue { stream, video } => {
            let store = open_store(&config)?;
            let entry = store
                .append_to_playlist(&stream, &video)
                .map_err(|e| e.to_string())?;
            print_json(&entry)
        }
        Command::List => {
            let store = open_store(&config)?;
            print_json(&store.snapshot())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
