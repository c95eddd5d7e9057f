//! Restream Daemon
//!
//! Background service that relays stored videos to live ingest endpoints:
//! playlist sequencing, encoder supervision, the live stream registry and
//! crash recovery.

pub mod daemon;
pub mod encoder;
pub mod engine;
pub mod events;
pub mod ingest;
pub mod model;
pub mod playlist;
pub mod probe;
pub mod recovery;
pub mod registry;
pub mod startup;
pub mod status_server;
pub mod store;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use daemon::{Daemon, DaemonError};
pub use encoder::{EncoderCommand, EncoderLauncher, ExitKind, ProcessLauncher, SpawnError};
pub use engine::{Engine, EngineError, EngineSettings};
pub use events::{EventBus, StopReason, StreamEvent};
pub use ingest::{delete_video, ingest_video};
pub use model::{PlaybackMode, PlaylistEntry, Stream, Video, VideoMetadata};
pub use playlist::{PlaylistError, Sequencer, Step};
pub use probe::{MetadataProbe, ProbeError};
pub use recovery::{recover_streams, run_recovery, RecoveryFailure, RecoveryReport};
pub use registry::{LiveStatus, StreamHandle, StreamPhase, StreamRegistry};
pub use restream_config as config;
pub use restream_config::Config;
pub use startup::{
    check_args_template, check_encoder_available, check_probe_available, parse_tool_version,
    run_startup_checks, StartupError,
};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use store::{AuditAction, AuditEntry, Library, LibraryStore, StoreError, StreamStore};
