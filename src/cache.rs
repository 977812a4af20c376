//! Session-owned caches of decoded chunks and paginated chapters
//!
//! `ChunkCache` keeps the most recently used chunks and never evicts the
//! chunk currently open for reading. `PageCache` keeps paginated chapters by
//! path and is tied to one pagination configuration.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::archive::ArchiveHandle;
use crate::chunk::ChunkMap;
use crate::error::ChunkLoadError;
use crate::layout::{Page, PaginationConfig};

/// Default number of decoded chunks kept in memory
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;
/// Default number of paginated chapters kept in memory
pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 64;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Decoded markup of every chapter in one chunk, keyed by chapter path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkContent {
    chapters: HashMap<String, String>,
}

impl ChunkContent {
    /// Markup of `path`.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.chapters.get(path).map(String::as_str)
    }

    /// Number of chapters held.
    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    /// Whether no chapter is held.
    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    /// Combined markup size in bytes.
    pub fn byte_len(&self) -> usize {
        self.chapters.values().map(String::len).sum()
    }
}

/// Decode the raw entries of chunk `index` into markup.
///
/// Every path must be present and valid UTF-8 (a leading BOM is dropped).
pub fn decode_chunk(
    index: usize,
    paths: &[String],
    mut raw: HashMap<String, Vec<u8>>,
) -> Result<ChunkContent, ChunkLoadError> {
    let mut chapters = HashMap::with_capacity(paths.len());
    for path in paths {
        let mut bytes = raw
            .remove(path)
            .ok_or_else(|| ChunkLoadError::MissingChapter {
                chunk: index,
                path: path.clone(),
            })?;
        if bytes.starts_with(UTF8_BOM) {
            bytes.drain(..UTF8_BOM.len());
        }
        let text = String::from_utf8(bytes).map_err(|_| ChunkLoadError::Decode {
            chunk: index,
            path: path.clone(),
        })?;
        chapters.insert(path.clone(), text);
    }
    Ok(ChunkContent { chapters })
}

/// LRU cache of decoded chunks with one pinned (currently open) entry
pub struct ChunkCache {
    entries: LruCache<usize, Arc<ChunkContent>>,
    capacity: usize,
    pinned: Option<usize>,
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` chunks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
            pinned: None,
        }
    }

    /// Maximum number of cached chunks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether chunk `index` is cached.
    pub fn contains(&self, index: usize) -> bool {
        self.entries.contains(&index)
    }

    /// Cached chunk `index`, marking it most recently used.
    pub fn get(&mut self, index: usize) -> Option<Arc<ChunkContent>> {
        self.entries.get(&index).cloned()
    }

    /// Cached chunk `index` without touching recency.
    pub fn peek(&self, index: usize) -> Option<Arc<ChunkContent>> {
        self.entries.peek(&index).cloned()
    }

    /// Mark `index` as the chunk open for reading; it is exempt from eviction.
    pub fn pin(&mut self, index: usize) {
        self.pinned = Some(index);
        self.evict_to_capacity(index);
    }

    /// Currently pinned chunk.
    pub fn pinned(&self) -> Option<usize> {
        self.pinned
    }

    /// Insert a decoded chunk and evict down to capacity.
    ///
    /// Neither the pinned chunk nor `index` itself is evicted, so the cache
    /// can briefly hold one chunk over capacity until the pin moves.
    pub fn insert(&mut self, index: usize, content: Arc<ChunkContent>) {
        self.entries.put(index, content);
        self.evict_to_capacity(index);
    }

    /// Drop every cached chunk and the pin.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pinned = None;
    }

    fn evict_to_capacity(&mut self, keep: usize) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .map(|(idx, _)| *idx)
                .find(|idx| *idx != keep && Some(*idx) != self.pinned);
            match victim {
                Some(idx) => {
                    self.entries.pop(&idx);
                    log::debug!("[CHUNK] Evicted chunk {}", idx);
                }
                None => break,
            }
        }
    }

    /// Return chunk `index`, loading it from `archive` if not cached.
    ///
    /// All of the chunk's chapters are fetched in one batched archive read on
    /// a blocking thread.
    pub async fn get_or_load(
        &mut self,
        index: usize,
        chunks: &ChunkMap,
        archive: &ArchiveHandle,
    ) -> Result<Arc<ChunkContent>, ChunkLoadError> {
        if let Some(content) = self.get(index) {
            return Ok(content);
        }

        let paths = chunks
            .chapters(index)
            .ok_or(ChunkLoadError::UnknownChunk(index))?
            .to_vec();
        let content =
            Arc::new(crate::async_api::load_chunk_async(archive.clone(), index, paths).await?);
        log::info!(
            "[CHUNK] Loaded chunk {} ({} chapters, {} bytes)",
            index,
            content.len(),
            content.byte_len()
        );
        self.insert(index, content.clone());
        Ok(content)
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CACHE_CAPACITY)
    }
}

/// LRU cache of paginated chapters for one pagination configuration
pub struct PageCache {
    entries: LruCache<String, Arc<Vec<Page>>>,
    config: PaginationConfig,
}

impl PageCache {
    /// Create a cache for `config` holding at most `capacity` chapters.
    pub fn new(capacity: usize, config: PaginationConfig) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            config,
        }
    }

    /// Configuration the cached pages were produced with.
    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Switch to `config`, dropping every entry if it differs.
    ///
    /// Returns whether the cache was invalidated.
    pub fn set_config(&mut self, config: PaginationConfig) -> bool {
        if config == self.config {
            return false;
        }
        self.config = config;
        self.entries.clear();
        log::debug!("[PAGINATE] Pagination config changed, page cache cleared");
        true
    }

    /// Cached pages of `path`, marking it most recently used.
    pub fn get(&mut self, path: &str) -> Option<Arc<Vec<Page>>> {
        self.entries.get(path).cloned()
    }

    /// Page count of `path` if it is cached, without touching recency.
    pub fn page_count(&self, path: &str) -> Option<usize> {
        self.entries.peek(path).map(|pages| pages.len())
    }

    /// Cache the pages of `path`.
    pub fn insert(&mut self, path: String, pages: Arc<Vec<Page>>) {
        self.entries.put(path, pages);
    }

    /// Number of cached chapters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Viewport;

    fn content(tag: &str) -> Arc<ChunkContent> {
        let paths = vec![format!("{}.xhtml", tag)];
        let raw = HashMap::from([(paths[0].clone(), format!("<p>{}</p>", tag).into_bytes())]);
        Arc::new(decode_chunk(0, &paths, raw).unwrap())
    }

    fn page(n: usize) -> Arc<Vec<Page>> {
        Arc::new(
            (0..n)
                .map(|i| Page {
                    content: format!("<p>{}</p>", i),
                    chapter_index: 0,
                    page_index: i,
                    total_pages_in_chapter: n,
                })
                .collect(),
        )
    }

    #[test]
    fn test_decode_chunk_strips_bom() {
        let paths = vec!["a.xhtml".to_string()];
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("<p>café</p>".as_bytes());
        let decoded = decode_chunk(1, &paths, HashMap::from([(paths[0].clone(), bytes)])).unwrap();
        assert_eq!(decoded.get("a.xhtml"), Some("<p>café</p>"));
    }

    #[test]
    fn test_decode_chunk_missing_chapter() {
        let paths = vec!["a.xhtml".to_string(), "b.xhtml".to_string()];
        let raw = HashMap::from([("a.xhtml".to_string(), b"<p/>".to_vec())]);
        assert_eq!(
            decode_chunk(4, &paths, raw),
            Err(ChunkLoadError::MissingChapter {
                chunk: 4,
                path: "b.xhtml".into()
            })
        );
    }

    #[test]
    fn test_decode_chunk_invalid_utf8() {
        let paths = vec!["a.xhtml".to_string()];
        let raw = HashMap::from([("a.xhtml".to_string(), vec![0x3C, 0xFF, 0xFE])]);
        assert!(matches!(
            decode_chunk(0, &paths, raw),
            Err(ChunkLoadError::Decode { chunk: 0, .. })
        ));
    }

    #[test]
    fn test_chunk_cache_evicts_least_recent() {
        let mut cache = ChunkCache::new(2);
        cache.insert(0, content("a"));
        cache.insert(1, content("b"));
        cache.get(0);
        cache.insert(2, content("c"));
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    fn test_chunk_cache_never_evicts_pinned() {
        let mut cache = ChunkCache::new(2);
        cache.insert(0, content("a"));
        cache.pin(0);
        cache.insert(1, content("b"));
        cache.insert(2, content("c"));
        cache.insert(3, content("d"));
        assert!(cache.contains(0));
        assert!(cache.contains(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_chunk_cache_keeps_incoming_chunk_while_pin_moves() {
        let mut cache = ChunkCache::new(1);
        cache.insert(0, content("a"));
        cache.pin(0);
        cache.insert(1, content("b"));
        assert!(cache.contains(0));
        assert!(cache.contains(1));

        cache.pin(1);
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_chunk_cache_minimum_capacity() {
        let mut cache = ChunkCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(0, content("a"));
        cache.insert(1, content("b"));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(1));
    }

    #[test]
    fn test_page_cache_invalidated_on_config_change() {
        let config = PaginationConfig::default();
        let mut cache = PageCache::new(4, config);
        cache.insert("a.xhtml".into(), page(3));
        assert!(!cache.set_config(config));
        assert_eq!(cache.page_count("a.xhtml"), Some(3));

        assert!(cache.set_config(config.with_viewport(Viewport::new(320.0, 480.0))));
        assert!(cache.is_empty());
        assert!(cache.get("a.xhtml").is_none());
    }

    #[test]
    fn test_page_cache_bounded() {
        let mut cache = PageCache::new(2, PaginationConfig::default());
        cache.insert("a".into(), page(1));
        cache.insert("b".into(), page(1));
        cache.insert("c".into(), page(1));
        assert_eq!(cache.len(), 2);
        assert!(cache.page_count("a").is_none());
    }
}
