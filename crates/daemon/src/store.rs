//! Storage module for restream
//!
//! The engine talks to persistence through the narrow [`StreamStore`] trait.
//! [`LibraryStore`] is the bundled implementation: one JSON document holding
//! streams, videos and playlists, rewritten atomically after every mutation,
//! plus an append-only JSON-lines audit log.

use crate::model::{PlaylistEntry, Stream, Video};
use crate::playlist::{move_item, normalize_entries, PlaylistError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const LIBRARY_FILE: &str = "library.json";
const AUDIT_FILE: &str = "audit.log";

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("video not found: {0}")]
    VideoNotFound(String),

    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to (de)serialize library: {0}")]
    Serde(#[from] serde_json::Error),
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Start,
    Advance,
    Stop,
    Fail,
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp_ms: i64,
    pub stream_id: String,
    pub action: AuditAction,
    pub video_id: Option<String>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(stream_id: &str, action: AuditAction, video_id: Option<&str>) -> Self {
        Self {
            timestamp_ms: current_timestamp_ms(),
            stream_id: stream_id.to_string(),
            action,
            video_id: video_id.map(str::to_string),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Persistence interface consumed by the engine and the recovery pass.
pub trait StreamStore: Send + Sync {
    /// Look up a stream record.
    fn stream(&self, stream_id: &str) -> Result<Option<Stream>, StoreError>;

    /// Videos of a stream's playlist, in play order.
    fn playlist(&self, stream_id: &str) -> Result<Vec<Video>, StoreError>;

    /// `Some(video)` marks the stream streaming that video; `None` marks it idle.
    fn set_streaming_state(
        &self,
        stream_id: &str,
        current_video: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Every stream persisted with `is_streaming = true`.
    fn streaming_streams(&self) -> Result<Vec<Stream>, StoreError>;

    /// Remove a stream record and its playlist.
    fn delete_stream(&self, stream_id: &str) -> Result<Stream, StoreError>;

    /// Best-effort audit trail.
    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

/// Everything the library document holds.
///
/// Playlists are vectors of video ids, so an entry's order is its index and
/// the sequence is dense by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Library {
    #[serde(default)]
    pub streams: BTreeMap<String, Stream>,
    #[serde(default)]
    pub videos: BTreeMap<String, Video>,
    #[serde(default)]
    pub playlists: BTreeMap<String, Vec<String>>,
}

impl Library {
    fn stream_mut(&mut self, stream_id: &str) -> Result<&mut Stream, StoreError> {
        self.streams
            .get_mut(stream_id)
            .ok_or_else(|| StoreError::StreamNotFound(stream_id.to_string()))
    }

    fn playlist_mut(&mut self, stream_id: &str) -> Result<&mut Vec<String>, StoreError> {
        if !self.streams.contains_key(stream_id) {
            return Err(StoreError::StreamNotFound(stream_id.to_string()));
        }
        Ok(self.playlists.entry(stream_id.to_string()).or_default())
    }
}

/// [`StreamStore`] backed by an in-memory [`Library`], optionally mirrored to disk.
pub struct LibraryStore {
    library: Mutex<Library>,
    state_dir: Option<PathBuf>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl LibraryStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            library: Mutex::new(Library::default()),
            state_dir: None,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Open (or create) the store rooted at `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LIBRARY_FILE);
        let library = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Library::default()
        };

        tracing::debug!(
            path = %path.display(),
            streams = library.streams.len(),
            videos = library.videos.len(),
            "opened library"
        );

        Ok(Self {
            library: Mutex::new(library),
            state_dir: Some(state_dir.to_path_buf()),
            audit: Mutex::new(Vec::new()),
        })
    }

    /// Apply `f` to a copy of the library, persist it, then publish it.
    ///
    /// Readers never observe a mutation that failed to persist. Writes from
    /// every stream serialize on the one library lock and each rewrites the
    /// whole file, so async callers go through `spawn_blocking`.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Library) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.library.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if let Some(dir) = &self.state_dir {
            write_library(dir, &next)?;
        }
        *guard = next;
        Ok(out)
    }

    pub fn snapshot(&self) -> Library {
        self.library.lock().clone()
    }

    pub fn streams(&self) -> Vec<Stream> {
        self.library.lock().streams.values().cloned().collect()
    }

    pub fn video(&self, video_id: &str) -> Option<Video> {
        self.library.lock().videos.get(video_id).cloned()
    }

    pub fn videos(&self) -> Vec<Video> {
        self.library.lock().videos.values().cloned().collect()
    }

    /// Playlist entries of a stream with their dense orders.
    pub fn entries(&self, stream_id: &str) -> Vec<PlaylistEntry> {
        self.library
            .lock()
            .playlists
            .get(stream_id)
            .map(|ids| {
                ids.iter()
                    .enumerate()
                    .map(|(order, video_id)| PlaylistEntry {
                        stream_id: stream_id.to_string(),
                        video_id: video_id.clone(),
                        order,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or replace a stream record.
    pub fn upsert_stream(&self, stream: Stream) -> Result<(), StoreError> {
        self.mutate(|lib| {
            lib.streams.insert(stream.id.clone(), stream);
            Ok(())
        })
    }

    pub fn add_video(&self, video: Video) -> Result<(), StoreError> {
        self.mutate(|lib| {
            lib.videos.insert(video.id.clone(), video);
            Ok(())
        })
    }

    /// Remove a video record and every playlist entry pointing at it.
    pub fn delete_video(&self, video_id: &str) -> Result<Video, StoreError> {
        self.mutate(|lib| {
            let video = lib
                .videos
                .remove(video_id)
                .ok_or_else(|| StoreError::VideoNotFound(video_id.to_string()))?;
            for ids in lib.playlists.values_mut() {
                ids.retain(|id| id != video_id);
            }
            Ok(video)
        })
    }

    /// Append a video to the end of a stream's playlist.
    pub fn append_to_playlist(
        &self,
        stream_id: &str,
        video_id: &str,
    ) -> Result<PlaylistEntry, StoreError> {
        self.mutate(|lib| {
            if !lib.videos.contains_key(video_id) {
                return Err(StoreError::VideoNotFound(video_id.to_string()));
            }
            let ids = lib.playlist_mut(stream_id)?;
            ids.push(video_id.to_string());
            Ok(PlaylistEntry {
                stream_id: stream_id.to_string(),
                video_id: video_id.to_string(),
                order: ids.len() - 1,
            })
        })
    }

    /// Remove the entry at `order`; later entries shift down by one.
    pub fn remove_from_playlist(
        &self,
        stream_id: &str,
        order: usize,
    ) -> Result<PlaylistEntry, StoreError> {
        self.mutate(|lib| {
            let ids = lib.playlist_mut(stream_id)?;
            if order >= ids.len() {
                return Err(PlaylistError::OutOfRange {
                    index: order,
                    len: ids.len(),
                }
                .into());
            }
            let video_id = ids.remove(order);
            Ok(PlaylistEntry {
                stream_id: stream_id.to_string(),
                video_id,
                order,
            })
        })
    }

    /// Move the entry at `from` to `to`.
    pub fn move_in_playlist(
        &self,
        stream_id: &str,
        from: usize,
        to: usize,
    ) -> Result<(), StoreError> {
        self.mutate(|lib| {
            let ids = lib.playlist_mut(stream_id)?;
            move_item(ids, from, to)?;
            Ok(())
        })
    }

    /// Replace a stream's playlist with `entries`, taken in order of their
    /// `order` field. Gaps and duplicates in the incoming orders are closed.
    pub fn set_playlist(
        &self,
        stream_id: &str,
        mut entries: Vec<PlaylistEntry>,
    ) -> Result<Vec<PlaylistEntry>, StoreError> {
        normalize_entries(&mut entries);
        self.mutate(|lib| {
            if let Some(missing) = entries.iter().find(|e| !lib.videos.contains_key(&e.video_id)) {
                return Err(StoreError::VideoNotFound(missing.video_id.clone()));
            }
            let ids = lib.playlist_mut(stream_id)?;
            *ids = entries.iter().map(|e| e.video_id.clone()).collect();
            Ok(())
        })?;
        Ok(self.entries(stream_id))
    }

    /// Audit entries recorded by an in-memory store.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }
}

impl StreamStore for LibraryStore {
    fn stream(&self, stream_id: &str) -> Result<Option<Stream>, StoreError> {
        Ok(self.library.lock().streams.get(stream_id).cloned())
    }

    fn playlist(&self, stream_id: &str) -> Result<Vec<Video>, StoreError> {
        let lib = self.library.lock();
        if !lib.streams.contains_key(stream_id) {
            return Err(StoreError::StreamNotFound(stream_id.to_string()));
        }
        let ids = lib.playlists.get(stream_id).map(Vec::as_slice).unwrap_or(&[]);
        // Entries are removed together with their video, so every id resolves
        Ok(ids
            .iter()
            .filter_map(|id| lib.videos.get(id).cloned())
            .collect())
    }

    fn set_streaming_state(
        &self,
        stream_id: &str,
        current_video: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate(|lib| {
            let stream = lib.stream_mut(stream_id)?;
            stream.is_streaming = current_video.is_some();
            stream.current_video = current_video.map(str::to_string);
            Ok(())
        })
    }

    fn streaming_streams(&self) -> Result<Vec<Stream>, StoreError> {
        Ok(self
            .library
            .lock()
            .streams
            .values()
            .filter(|s| s.is_streaming)
            .cloned()
            .collect())
    }

    fn delete_stream(&self, stream_id: &str) -> Result<Stream, StoreError> {
        self.mutate(|lib| {
            lib.playlists.remove(stream_id);
            lib.streams
                .remove(stream_id)
                .ok_or_else(|| StoreError::StreamNotFound(stream_id.to_string()))
        })
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        match &self.state_dir {
            Some(dir) => {
                let mut line = serde_json::to_string(entry)?;
                line.push('\n');
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(AUDIT_FILE))?;
                file.write_all(line.as_bytes())?;
            }
            None => self.audit.lock().push(entry.clone()),
        }
        Ok(())
    }
}

/// Write the library next to its final location, then rename over it.
fn write_library(dir: &Path, library: &Library) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(library)?;
    let tmp = dir.join(format!("{}.tmp", LIBRARY_FILE));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, dir.join(LIBRARY_FILE))?;
    Ok(())
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlaybackMode, VideoMetadata};
    use tempfile::TempDir;

    fn video(id: &str) -> Video {
        Video {
            id: id.to_string(),
            owner_id: "u1".to_string(),
            path: PathBuf::from(format!("/media/{}.mp4", id)),
            size_bytes: 1024,
            metadata: VideoMetadata::default(),
        }
    }

    fn stream(id: &str) -> Stream {
        let mut s = Stream::new("u1", "rtmp://ingest.example/live", "key", PlaybackMode::Loop);
        s.id = id.to_string();
        s
    }

    fn seeded(store: &LibraryStore) {
        store.upsert_stream(stream("s1")).unwrap();
        for id in ["v1", "v2", "v3"] {
            store.add_video(video(id)).unwrap();
            store.append_to_playlist("s1", id).unwrap();
        }
    }

    fn orders(store: &LibraryStore, stream_id: &str) -> Vec<(usize, String)> {
        store
            .entries(stream_id)
            .into_iter()
            .map(|e| (e.order, e.video_id))
            .collect()
    }

    #[test]
    fn test_playlist_returns_videos_in_order() {
        let store = LibraryStore::in_memory();
        seeded(&store);

        let ids: Vec<String> = store.playlist("s1").unwrap().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["v1", "v2", "v3"]);
        assert!(matches!(
            store.playlist("missing"),
            Err(StoreError::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_remove_and_move_keep_orders_dense() {
        let store = LibraryStore::in_memory();
        seeded(&store);

        let removed = store.remove_from_playlist("s1", 0).unwrap();
        assert_eq!(removed.video_id, "v1");
        assert_eq!(
            orders(&store, "s1"),
            vec![(0, "v2".to_string()), (1, "v3".to_string())]
        );

        store.move_in_playlist("s1", 1, 0).unwrap();
        assert_eq!(
            orders(&store, "s1"),
            vec![(0, "v3".to_string()), (1, "v2".to_string())]
        );

        assert!(store.remove_from_playlist("s1", 5).is_err());
    }

    #[test]
    fn test_same_video_in_multiple_playlists_and_delete_cascades() {
        let store = LibraryStore::in_memory();
        seeded(&store);
        store.upsert_stream(stream("s2")).unwrap();
        store.append_to_playlist("s2", "v2").unwrap();
        store.append_to_playlist("s2", "v3").unwrap();

        store.delete_video("v2").unwrap();

        assert_eq!(
            orders(&store, "s1"),
            vec![(0, "v1".to_string()), (1, "v3".to_string())]
        );
        assert_eq!(orders(&store, "s2"), vec![(0, "v3".to_string())]);
        assert!(matches!(
            store.delete_video("v2"),
            Err(StoreError::VideoNotFound(_))
        ));
    }

    #[test]
    fn test_append_requires_known_stream_and_video() {
        let store = LibraryStore::in_memory();
        seeded(&store);
        assert!(matches!(
            store.append_to_playlist("s1", "nope"),
            Err(StoreError::VideoNotFound(_))
        ));
        assert!(matches!(
            store.append_to_playlist("nope", "v1"),
            Err(StoreError::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_streaming_state_round_trip() {
        let store = LibraryStore::in_memory();
        seeded(&store);

        store.set_streaming_state("s1", Some("v2")).unwrap();
        let streaming = store.streaming_streams().unwrap();
        assert_eq!(streaming.len(), 1);
        assert_eq!(streaming[0].current_video.as_deref(), Some("v2"));

        store.set_streaming_state("s1", None).unwrap();
        let s1 = store.stream("s1").unwrap().unwrap();
        assert!(!s1.is_streaming);
        assert_eq!(s1.current_video, None);
        assert!(store.streaming_streams().unwrap().is_empty());
    }

    #[test]
    fn test_delete_stream_removes_playlist() {
        let store = LibraryStore::in_memory();
        seeded(&store);
        store.delete_stream("s1").unwrap();
        assert!(store.stream("s1").unwrap().is_none());
        assert!(store.entries("s1").is_empty());
        // Videos survive stream deletion
        assert_eq!(store.videos().len(), 3);
    }

    #[test]
    fn test_open_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let store = LibraryStore::open(dir.path()).unwrap();
            seeded(&store);
            store.set_streaming_state("s1", Some("v3")).unwrap();
            store
                .append_audit(&AuditEntry::new("s1", AuditAction::Start, Some("v3")))
                .unwrap();
        }

        let reopened = LibraryStore::open(dir.path()).unwrap();
        let s1 = reopened.stream("s1").unwrap().unwrap();
        assert!(s1.is_streaming);
        assert_eq!(s1.current_video.as_deref(), Some("v3"));
        assert_eq!(reopened.entries("s1").len(), 3);

        let audit = fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        let entry: AuditEntry = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
        assert_eq!(entry.action, AuditAction::Start);
        assert_eq!(entry.video_id.as_deref(), Some("v3"));
        assert!(!dir.path().join("library.json.tmp").exists());
    }

    #[test]
    fn test_set_playlist_renumbers_incoming_orders() {
        let store = LibraryStore::in_memory();
        seeded(&store);
        let entry = |video: &str, order| PlaylistEntry {
            stream_id: "s1".to_string(),
            video_id: video.to_string(),
            order,
        };

        let entries = store
            .set_playlist("s1", vec![entry("v3", 10), entry("v1", 2), entry("v1", 5)])
            .unwrap();
        assert_eq!(
            entries.into_iter().map(|e| (e.order, e.video_id)).collect::<Vec<_>>(),
            vec![(0, "v1".to_string()), (1, "v1".to_string()), (2, "v3".to_string())]
        );

        assert!(matches!(
            store.set_playlist("s1", vec![entry("nope", 0)]),
            Err(StoreError::VideoNotFound(_))
        ));
        assert_eq!(store.entries("s1").len(), 3);
    }

    #[test]
    fn test_failed_mutation_leaves_library_untouched() {
        let store = LibraryStore::in_memory();
        seeded(&store);
        let before = store.snapshot();
        assert!(store.set_streaming_state("missing", Some("v1")).is_err());
        assert_eq!(store.snapshot(), before);
    }
}
