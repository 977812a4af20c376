//! Chunk planning: size-bounded groups of consecutive spine chapters
//!
//! A [`ChunkMap`] is built once per book with [`plan`] and persisted with
//! the book record. Its serialized form is an object whose keys are chunk
//! labels (`"chunk0"`, `"chunk1"`, ...) in reading order.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default upper bound on a chunk's combined uncompressed size (100 KiB)
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 100 * 1024;

/// Label prefix for sequentially numbered chunks
const CHUNK_LABEL_PREFIX: &str = "chunk";

/// One chunk: a label plus the chapter paths it holds, in reading order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk label (`"chunk{index}"` for planned maps)
    pub id: String,
    /// Archive entry paths of the chapters
    pub chapters: Vec<String>,
}

/// Ordered partition of the spine into chunks
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkMap {
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    /// Build a map from already-labeled chunks, keeping their order.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the map has no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk at `index`.
    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Chapter paths of the chunk at `index`.
    pub fn chapters(&self, index: usize) -> Option<&[String]> {
        self.chunks.get(index).map(|c| c.chapters.as_slice())
    }

    /// Iterate over chunks in reading order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Every chapter path, chunk by chunk, in reading order.
    pub fn all_chapters(&self) -> impl Iterator<Item = &str> {
        self.chunks
            .iter()
            .flat_map(|c| c.chapters.iter().map(String::as_str))
    }

    /// Total chapter count across all chunks.
    pub fn total_chapters(&self) -> usize {
        self.chunks.iter().map(|c| c.chapters.len()).sum()
    }

    /// Linear chapter index of `(chunk, chapter)`: the chapters of all
    /// preceding chunks plus `chapter`.
    pub fn global_index(&self, chunk: usize, chapter: usize) -> usize {
        self.chunks
            .iter()
            .take(chunk)
            .map(|c| c.chapters.len())
            .sum::<usize>()
            + chapter
    }

    /// Inverse of [`ChunkMap::global_index`].
    pub fn position_of(&self, global_index: usize) -> Option<(usize, usize)> {
        let mut remaining = global_index;
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            if remaining < chunk.chapters.len() {
                return Some((chunk_idx, remaining));
            }
            remaining -= chunk.chapters.len();
        }
        None
    }

    /// Find `(chunk, chapter)` of a chapter path.
    pub fn locate(&self, path: &str) -> Option<(usize, usize)> {
        self.chunks.iter().enumerate().find_map(|(chunk_idx, chunk)| {
            chunk
                .chapters
                .iter()
                .position(|p| p == path)
                .map(|chapter_idx| (chunk_idx, chapter_idx))
        })
    }
}

/// Label of the chunk at `index`.
pub fn chunk_label(index: usize) -> String {
    format!("{}{}", CHUNK_LABEL_PREFIX, index)
}

/// Partition `chapters` into chunks using greedy single-pass packing.
///
/// A chapter starts a new chunk when it would push the running total past
/// `max_chunk_bytes` and the current chunk is non-empty. Oversized chapters
/// are never split. Chapters with no known size count as zero bytes.
pub fn plan<S, F>(chapters: &[S], entry_size: F, max_chunk_bytes: u64) -> ChunkMap
where
    S: AsRef<str>,
    F: Fn(&str) -> Option<u64>,
{
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_size = 0u64;

    for path in chapters {
        let path = path.as_ref();
        let size = entry_size(path).unwrap_or_else(|| {
            log::debug!("[CHUNK] no size for {}, counting as 0", path);
            0
        });

        if !current.is_empty() && current_size.saturating_add(size) > max_chunk_bytes {
            chunks.push(Chunk {
                id: chunk_label(chunks.len()),
                chapters: std::mem::take(&mut current),
            });
            current_size = 0;
        }
        current.push(path.to_string());
        current_size = current_size.saturating_add(size);
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            id: chunk_label(chunks.len()),
            chapters: current,
        });
    }

    log::info!(
        "[CHUNK] Planned {} chunks for {} chapters (max {} bytes)",
        chunks.len(),
        chapters.len(),
        max_chunk_bytes
    );
    ChunkMap { chunks }
}

/// [`plan`] with sizes from an entry-size listing.
pub fn plan_with_sizes<S: AsRef<str>>(
    chapters: &[S],
    sizes: &HashMap<String, u64>,
    max_chunk_bytes: u64,
) -> ChunkMap {
    plan(chapters, |path| sizes.get(path).copied(), max_chunk_bytes)
}

impl Serialize for ChunkMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.chunks.len()))?;
        for chunk in &self.chunks {
            map.serialize_entry(&chunk.id, &chunk.chapters)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ChunkMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ChunkMapVisitor)
    }
}

struct ChunkMapVisitor;

impl<'de> Visitor<'de> for ChunkMapVisitor {
    type Value = ChunkMap;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of chunk labels to chapter path lists")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ChunkMap, A::Error> {
        let mut chunks = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((id, chapters)) = access.next_entry::<String, Vec<String>>()? {
            chunks.push(Chunk { id, chapters });
        }

        // Stores that do not keep key order still round-trip when every
        // label carries its index.
        let indices: Option<Vec<usize>> = chunks.iter().map(|c| label_index(&c.id)).collect();
        if let Some(indices) = indices {
            let mut keyed: Vec<(usize, Chunk)> = indices.into_iter().zip(chunks).collect();
            keyed.sort_by_key(|(idx, _)| *idx);
            chunks = keyed.into_iter().map(|(_, c)| c).collect();
        }
        Ok(ChunkMap { chunks })
    }
}

fn label_index(label: &str) -> Option<usize> {
    label.strip_prefix(CHUNK_LABEL_PREFIX)?.parse().ok()
}
