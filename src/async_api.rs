//! Async wrappers around blocking archive work.
//!
//! ZIP reads and inflation run on tokio's blocking pool so a session's
//! runtime threads never stall on file I/O.

use std::sync::Arc;

use crate::archive::{ArchiveHandle, ArchiveReader};
use crate::cache::{decode_chunk, ChunkContent};
use crate::chunk::ChunkMap;
use crate::error::{ArchiveError, ChunkLoadError, ReaderError};
use crate::library::{import_metadata, plan_book_chunks, BookMetadata};

fn aborted(identity: &str, err: tokio::task::JoinError) -> ReaderError {
    ArchiveError::Unreadable {
        identity: identity.to_string(),
        reason: format!("blocking task failed: {}", err),
    }
    .into()
}

/// Open (or reuse) the archive at `identity` on a blocking thread.
pub async fn open_archive_async(
    archives: Arc<ArchiveReader>,
    identity: String,
) -> Result<ArchiveHandle, ReaderError> {
    let id = identity.clone();
    tokio::task::spawn_blocking(move || archives.open(&id))
        .await
        .map_err(|e| aborted(&identity, e))?
        .map_err(ReaderError::from)
}

/// Import book metadata from `identity` on a blocking thread.
pub async fn import_metadata_async(
    archives: Arc<ArchiveReader>,
    identity: String,
) -> Result<BookMetadata, ReaderError> {
    let id = identity.clone();
    tokio::task::spawn_blocking(move || import_metadata(&archives, &id))
        .await
        .map_err(|e| aborted(&identity, e))?
}

/// Plan the chunk map of an open archive on a blocking thread.
pub async fn plan_book_chunks_async(
    handle: ArchiveHandle,
    max_chunk_bytes: u64,
) -> Result<ChunkMap, ReaderError> {
    let identity = handle.identity().to_string();
    tokio::task::spawn_blocking(move || plan_book_chunks(&handle, max_chunk_bytes))
        .await
        .map_err(|e| aborted(&identity, e))?
}

/// Read and decode every chapter of chunk `index` in one batched read.
pub async fn load_chunk_async(
    handle: ArchiveHandle,
    index: usize,
    paths: Vec<String>,
) -> Result<ChunkContent, ChunkLoadError> {
    tokio::task::spawn_blocking(move || {
        let raw = handle
            .read_entries(&paths)
            .map_err(|source| ChunkLoadError::Archive {
                chunk: index,
                source,
            })?;
        decode_chunk(index, &paths, raw)
    })
    .await
    .map_err(|_| ChunkLoadError::Aborted { chunk: index })?
}
