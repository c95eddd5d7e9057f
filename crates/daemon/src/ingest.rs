//! Video ingestion: turn a file on disk into a library record.

use crate::model::Video;
use crate::probe::MetadataProbe;
use crate::store::{LibraryStore, StoreError};
use std::fs;
use std::io;
use std::path::Path;

/// Register `path` as a video owned by `owner_id`.
///
/// The file must exist; metadata is best effort and may come back empty.
pub fn ingest_video(
    store: &LibraryStore,
    probe: &MetadataProbe,
    owner_id: &str,
    path: &Path,
) -> Result<Video, StoreError> {
    let size_bytes = fs::metadata(path)?.len();
    let metadata = probe.probe(path);
    let video = Video::new(owner_id, path.to_path_buf(), size_bytes, metadata);

    store.add_video(video.clone())?;
    tracing::info!(
        video_id = %video.id,
        path = %path.display(),
        size_bytes,
        duration_secs = video.metadata.duration_secs,
        "video ingested"
    );
    Ok(video)
}

/// Remove a video record and its playlist entries, optionally deleting the
/// file as well. A file that is already gone is not an error.
pub fn delete_video(
    store: &LibraryStore,
    video_id: &str,
    remove_file: bool,
) -> Result<Video, StoreError> {
    let video = store.delete_video(video_id)?;

    if remove_file {
        match fs::remove_file(&video.path) {
            Ok(()) => tracing::debug!(path = %video.path.display(), "removed video file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %video.path.display(), "video file already missing");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(video_id, "video deleted");
    Ok(video)
}
