//! Reader session: the chunk -> chapter -> page navigation state machine
//!
//! A session owns the caches for one open book. Every operation takes
//! `&mut self`, so at most one load is ever in flight and transitions apply
//! in call order. Transition targets are computed by the pure
//! [`plan_next`]/[`plan_prev`] functions; the session then loads whatever
//! the target needs (chunk, pagination) before it commits the new position.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::archive::{ArchiveHandle, ArchiveReader};
use crate::async_api::{open_archive_async, plan_book_chunks_async};
use crate::cache::{ChunkCache, PageCache};
use crate::chunk::ChunkMap;
use crate::config::ReaderConfig;
use crate::error::{ChunkLoadError, ReaderError};
use crate::layout::{paginate, Page, PaginationConfig};
use crate::library::{BookMetadata, Library};
use crate::store;

/// `(chunk, chapter within chunk, page within chapter)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderPosition {
    /// Chunk index
    pub chunk: usize,
    /// Chapter index within the chunk
    pub chapter: usize,
    /// Page index within the chapter
    pub page: usize,
}

impl ReaderPosition {
    /// Create a position.
    pub fn new(chunk: usize, chapter: usize, page: usize) -> Self {
        Self {
            chunk,
            chapter,
            page,
        }
    }
}

/// Session status
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SessionStatus {
    /// No document loaded
    #[default]
    Idle,
    /// A document, chunk or chapter is being loaded
    Loading,
    /// Positioned and ready to render
    Ready(ReaderPosition),
    /// Last operation failed; the previous position (if any) is kept
    Error(ReaderError),
}

/// Edge of the book reached by navigation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    /// Before the first page
    Start,
    /// After the last page
    End,
}

/// Result of a page-turn request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavOutcome {
    /// The session moved to a new position
    Moved(ReaderPosition),
    /// Already at the first or last page; nothing changed
    Boundary(Boundary),
}

/// Which page of a chapter a transition lands on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Landing {
    /// Page 0
    First,
    /// The chapter's final page (known only after pagination)
    Last,
}

/// Planned transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Move within the current chapter
    Page(usize),
    /// Move to another chapter of the current chunk
    Chapter {
        /// Chapter index within the chunk
        chapter: usize,
        /// Landing page
        landing: Landing,
    },
    /// Move into another chunk
    Chunk {
        /// Chunk index
        chunk: usize,
        /// Chapter index within that chunk
        chapter: usize,
        /// Landing page
        landing: Landing,
    },
    /// No move possible
    Boundary(Boundary),
}

/// Inputs for transition planning
#[derive(Clone, Copy, Debug)]
pub struct NavContext<'a> {
    /// Current position
    pub position: ReaderPosition,
    /// Page count of the current chapter
    pub pages_in_chapter: usize,
    /// Chapter count of every chunk
    pub chapters_per_chunk: &'a [usize],
}

/// Plan the transition for "next page". Empty chunks are skipped.
pub fn plan_next(ctx: &NavContext<'_>) -> Step {
    let pos = ctx.position;
    if pos.page + 1 < ctx.pages_in_chapter {
        return Step::Page(pos.page + 1);
    }
    let chapters = ctx.chapters_per_chunk.get(pos.chunk).copied().unwrap_or(0);
    if pos.chapter + 1 < chapters {
        return Step::Chapter {
            chapter: pos.chapter + 1,
            landing: Landing::First,
        };
    }
    match (pos.chunk + 1..ctx.chapters_per_chunk.len()).find(|&c| ctx.chapters_per_chunk[c] > 0) {
        Some(chunk) => Step::Chunk {
            chunk,
            chapter: 0,
            landing: Landing::First,
        },
        None => Step::Boundary(Boundary::End),
    }
}

/// Plan the transition for "previous page". Empty chunks are skipped.
pub fn plan_prev(ctx: &NavContext<'_>) -> Step {
    let pos = ctx.position;
    if pos.page > 0 {
        return Step::Page(pos.page.min(ctx.pages_in_chapter.max(1)) - 1);
    }
    if pos.chapter > 0 {
        return Step::Chapter {
            chapter: pos.chapter - 1,
            landing: Landing::Last,
        };
    }
    let earlier = (0..pos.chunk.min(ctx.chapters_per_chunk.len()))
        .rev()
        .find(|&c| ctx.chapters_per_chunk[c] > 0);
    match earlier {
        Some(chunk) => Step::Chunk {
            chunk,
            chapter: ctx.chapters_per_chunk[chunk] - 1,
            landing: Landing::Last,
        },
        None => Step::Boundary(Boundary::Start),
    }
}

/// Page-based progress through the whole book
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingProgress {
    /// 1-based global page of the current position
    pub current: usize,
    /// Known page total (chapters not yet paginated count as one page)
    pub total: usize,
    /// `current / total * 100`, 0 when nothing is loaded
    pub percentage: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageTarget {
    First,
    Last,
    Index(usize),
}

impl From<Landing> for PageTarget {
    fn from(landing: Landing) -> Self {
        match landing {
            Landing::First => PageTarget::First,
            Landing::Last => PageTarget::Last,
        }
    }
}

/// Clamp a jump target into a chunk that has chapters.
///
/// An empty chunk resolves to the start of the next non-empty chunk, or
/// failing that to the end of the previous one.
fn resolve_jump(
    chapters_per_chunk: &[usize],
    chunk: usize,
    chapter: usize,
    target: PageTarget,
) -> Option<(usize, usize, PageTarget)> {
    let chunk = chunk.min(chapters_per_chunk.len().checked_sub(1)?);
    if chapters_per_chunk[chunk] > 0 {
        return Some((chunk, chapter.min(chapters_per_chunk[chunk] - 1), target));
    }
    let later = (chunk + 1..chapters_per_chunk.len()).find(|&c| chapters_per_chunk[c] > 0);
    if let Some(next) = later {
        return Some((next, 0, PageTarget::First));
    }
    (0..chunk)
        .rev()
        .find(|&c| chapters_per_chunk[c] > 0)
        .map(|prev| (prev, chapters_per_chunk[prev] - 1, PageTarget::Last))
}

struct OpenBook {
    meta: BookMetadata,
    chunks: ChunkMap,
    chapters_per_chunk: Vec<usize>,
    archive: ArchiveHandle,
}

/// Navigation state machine for one open book
pub struct ReaderSession {
    archives: Arc<ArchiveReader>,
    library: Library,
    config: ReaderConfig,
    book: Option<OpenBook>,
    chunk_cache: ChunkCache,
    page_cache: PageCache,
    words_per_page: usize,
    position: ReaderPosition,
    pages: Arc<Vec<Page>>,
    /// Page totals reported by a reflowing rendering surface, by chapter path
    reported_pages: HashMap<String, usize>,
    status: watch::Sender<SessionStatus>,
}

impl ReaderSession {
    /// Create an idle session.
    pub fn new(archives: Arc<ArchiveReader>, library: Library, config: ReaderConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            archives,
            library,
            chunk_cache: ChunkCache::new(config.chunk_cache_capacity),
            page_cache: PageCache::new(config.page_cache_capacity, config.pagination),
            words_per_page: config.pagination.words_per_page(),
            config,
            book: None,
            position: ReaderPosition::default(),
            pages: Arc::new(Vec::new()),
            reported_pages: HashMap::new(),
            status,
        }
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes, including transient `Loading`.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: SessionStatus) {
        log::debug!("[SESSION] status -> {:?}", status);
        self.status.send_replace(status);
    }

    fn fail<T>(&self, err: ReaderError) -> Result<T, ReaderError> {
        log::warn!("[SESSION] {}", err);
        self.set_status(SessionStatus::Error(err.clone()));
        Err(err)
    }

    /// Active configuration.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Current words-per-page budget.
    pub fn words_per_page(&self) -> usize {
        self.words_per_page
    }

    /// Metadata of the loaded book.
    pub fn book(&self) -> Option<&BookMetadata> {
        self.book.as_ref().map(|b| &b.meta)
    }

    /// Chunk map of the loaded book.
    pub fn chunk_map(&self) -> Option<&ChunkMap> {
        self.book.as_ref().map(|b| &b.chunks)
    }

    /// Current position, once a document is loaded.
    pub fn position(&self) -> Option<ReaderPosition> {
        self.book.as_ref().map(|_| self.position)
    }

    /// Archive path of the current chapter.
    pub fn current_chapter_path(&self) -> Option<&str> {
        let book = self.book.as_ref()?;
        book.chunks
            .chapters(self.position.chunk)?
            .get(self.position.chapter)
            .map(String::as_str)
    }

    /// Pages of the current chapter.
    pub fn current_pages(&self) -> &[Page] {
        &self.pages
    }

    /// Page at the current position.
    pub fn current_page(&self) -> Option<&Page> {
        self.book.as_ref()?;
        self.pages.get(self.position.page)
    }

    /// Page count of the current chapter, preferring a surface-reported total.
    pub fn pages_in_current_chapter(&self) -> usize {
        self.current_chapter_path()
            .and_then(|path| self.reported_pages.get(path).copied())
            .unwrap_or(self.pages.len())
    }

    /// Decoded chunk cache.
    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.chunk_cache
    }

    /// Paginated chapter cache.
    pub fn page_cache(&self) -> &PageCache {
        &self.page_cache
    }

    /// Load the book `key`, planning and persisting its chunk map if absent,
    /// and land on `(0, 0, 0)`.
    pub async fn load_document(&mut self, key: &str) -> Result<ReaderPosition, ReaderError> {
        self.set_status(SessionStatus::Loading);
        if let Err(err) = self.open_book(key).await {
            return self.fail(err);
        }
        self.jump(0, 0, PageTarget::First).await
    }

    /// Load the book `key` and land on its saved position (clamped), or on
    /// `(0, 0, 0)` when nothing was saved.
    pub async fn resume(&mut self, key: &str) -> Result<ReaderPosition, ReaderError> {
        self.set_status(SessionStatus::Loading);
        if let Err(err) = self.open_book(key).await {
            return self.fail(err);
        }
        let saved = match self.load_progress() {
            Ok(saved) => saved,
            Err(err) => {
                log::warn!("[SESSION] Ignoring unreadable saved position: {}", err);
                None
            }
        };
        match saved {
            Some(saved) => {
                log::info!("[SESSION] Restoring saved position {:?}", saved);
                self.navigate_to_position(saved.chunk, saved.chapter, saved.page)
                    .await
            }
            None => self.jump(0, 0, PageTarget::First).await,
        }
    }

    async fn open_book(&mut self, key: &str) -> Result<(), ReaderError> {
        let mut meta = self.library.get(key)?;

        if let Some(previous) = self.book.take() {
            if previous.meta.path != meta.path {
                self.archives.close(&previous.meta.path);
            }
        }
        self.reset_caches();

        let archive = open_archive_async(self.archives.clone(), meta.path.clone()).await?;
        let chunks = match meta.chunks.clone() {
            Some(chunks) => chunks,
            None => {
                let chunks =
                    plan_book_chunks_async(archive.clone(), self.config.max_chunk_bytes).await?;
                meta.chunks = Some(chunks.clone());
                self.library.update(&meta)?;
                chunks
            }
        };
        if chunks.total_chapters() == 0 {
            return Err(ChunkLoadError::UnknownChunk(0).into());
        }

        log::info!(
            "[SESSION] Loaded '{}' ({} chunks, {} chapters)",
            meta.title,
            chunks.len(),
            chunks.total_chapters()
        );
        let chapters_per_chunk = chunks.iter().map(|c| c.chapters.len()).collect();
        self.book = Some(OpenBook {
            meta,
            chunks,
            chapters_per_chunk,
            archive,
        });
        Ok(())
    }

    fn reset_caches(&mut self) {
        self.chunk_cache.clear();
        self.page_cache.clear();
        self.reported_pages.clear();
        self.pages = Arc::new(Vec::new());
        self.position = ReaderPosition::default();
    }

    fn nav_context(&self) -> Result<NavContext<'_>, ReaderError> {
        let book = self.book.as_ref().ok_or(ReaderError::NoDocument)?;
        Ok(NavContext {
            position: self.position,
            pages_in_chapter: self.pages_in_current_chapter(),
            chapters_per_chunk: &book.chapters_per_chunk,
        })
    }

    /// Advance one page, crossing chapter and chunk boundaries as needed.
    pub async fn next_page(&mut self) -> Result<NavOutcome, ReaderError> {
        let step = plan_next(&self.nav_context()?);
        self.apply_step(step).await
    }

    /// Go back one page, landing on the last page of earlier chapters.
    pub async fn prev_page(&mut self) -> Result<NavOutcome, ReaderError> {
        let step = plan_prev(&self.nav_context()?);
        self.apply_step(step).await
    }

    async fn apply_step(&mut self, step: Step) -> Result<NavOutcome, ReaderError> {
        let position = match step {
            Step::Page(page) => {
                self.position.page = page;
                self.settle()
            }
            Step::Chapter { chapter, landing } => {
                self.commit(self.position.chunk, chapter, landing.into()).await?
            }
            Step::Chunk {
                chunk,
                chapter,
                landing,
            } => self.commit(chunk, chapter, landing.into()).await?,
            Step::Boundary(boundary) => {
                log::debug!("[SESSION] At {:?} boundary", boundary);
                return Ok(NavOutcome::Boundary(boundary));
            }
        };
        Ok(NavOutcome::Moved(position))
    }

    /// Jump to a position, clamping every coordinate into range.
    ///
    /// A target inside an empty chunk moves to the nearest chunk with chapters.
    pub async fn navigate_to_position(
        &mut self,
        chunk: usize,
        chapter: usize,
        page: usize,
    ) -> Result<ReaderPosition, ReaderError> {
        self.jump(chunk, chapter, PageTarget::Index(page)).await
    }

    /// Load chunk `chunk` (clamped like [`Self::navigate_to_position`]) and
    /// land on its first page.
    pub async fn load_chunk_content(
        &mut self,
        chunk: usize,
    ) -> Result<ReaderPosition, ReaderError> {
        self.jump(chunk, 0, PageTarget::First).await
    }

    async fn jump(
        &mut self,
        chunk: usize,
        chapter: usize,
        target: PageTarget,
    ) -> Result<ReaderPosition, ReaderError> {
        let book = self.book.as_ref().ok_or(ReaderError::NoDocument)?;
        let resolved = resolve_jump(&book.chapters_per_chunk, chunk, chapter, target);
        match resolved {
            Some((chunk, chapter, target)) => self.commit(chunk, chapter, target).await,
            None => self.fail(ChunkLoadError::UnknownChunk(chunk).into()),
        }
    }

    /// Change viewport or font metrics: the page cache is dropped, the
    /// current chapter repaginated and the page index clamped.
    pub async fn update_pagination(
        &mut self,
        pagination: PaginationConfig,
    ) -> Result<ReaderPosition, ReaderError> {
        self.config.pagination = pagination;
        self.words_per_page = pagination.words_per_page();
        if self.page_cache.set_config(pagination) {
            self.reported_pages.clear();
        }
        log::info!(
            "[PAGINATE] New budget {} words per page",
            self.words_per_page
        );
        if self.book.is_none() {
            return Err(ReaderError::NoDocument);
        }
        let pos = self.position;
        self.commit(pos.chunk, pos.chapter, PageTarget::Index(pos.page))
            .await
    }

    /// Load whatever `(chunk, chapter)` needs, then commit the position.
    ///
    /// On failure the previous position stays in place.
    async fn commit(
        &mut self,
        chunk: usize,
        chapter: usize,
        target: PageTarget,
    ) -> Result<ReaderPosition, ReaderError> {
        let Some(book) = self.book.as_ref() else {
            return Err(ReaderError::NoDocument);
        };
        if !self.chunk_cache.contains(chunk) {
            self.set_status(SessionStatus::Loading);
        }

        let loaded = self
            .chunk_cache
            .get_or_load(chunk, &book.chunks, &book.archive)
            .await;
        let content = match loaded {
            Ok(content) => content,
            Err(err) => return self.fail(err.into()),
        };

        let Some(path) = book
            .chunks
            .chapters(chunk)
            .and_then(|chapters| chapters.get(chapter))
            .cloned()
        else {
            return self.fail(ChunkLoadError::UnknownChunk(chunk).into());
        };
        let Some(markup) = content.get(&path) else {
            return self.fail(ChunkLoadError::MissingChapter { chunk, path }.into());
        };
        let pages = self.pages_for(&path, markup, chapter);

        let count = self
            .reported_pages
            .get(&path)
            .copied()
            .unwrap_or(pages.len())
            .max(1);
        let page = match target {
            PageTarget::First => 0,
            PageTarget::Last => count - 1,
            PageTarget::Index(page) => page.min(count - 1),
        };

        self.chunk_cache.pin(chunk);
        self.pages = pages;
        self.position = ReaderPosition::new(chunk, chapter, page);
        Ok(self.settle())
    }

    fn pages_for(&mut self, path: &str, markup: &str, chapter: usize) -> Arc<Vec<Page>> {
        if let Some(pages) = self.page_cache.get(path) {
            return pages;
        }
        let pages = Arc::new(paginate(markup, self.words_per_page, chapter));
        self.page_cache.insert(path.to_string(), pages.clone());
        pages
    }

    /// Publish the committed position and autosave it.
    fn settle(&mut self) -> ReaderPosition {
        let position = self.position;
        self.set_status(SessionStatus::Ready(position));
        if self.config.autosave {
            if let Err(err) = self.save_progress() {
                log::warn!("[SESSION] Autosave failed: {}", err);
            }
        }
        position
    }

    /// Adopt a position reported by a reflowing rendering surface.
    ///
    /// Returns `None` when `chapter_path` is not in the current chunk (the
    /// report is stale and is ignored).
    pub fn apply_surface_report(
        &mut self,
        chapter_path: &str,
        page: usize,
        total_pages: usize,
    ) -> Result<Option<ReaderPosition>, ReaderError> {
        let book = self.book.as_ref().ok_or(ReaderError::NoDocument)?;
        let chunk = self.position.chunk;
        let Some(chapter) = book
            .chunks
            .chapters(chunk)
            .and_then(|chapters| chapters.iter().position(|p| p == chapter_path))
        else {
            log::debug!(
                "[SESSION] Ignoring stale report for {} (chunk {})",
                chapter_path,
                chunk
            );
            return Ok(None);
        };

        if chapter != self.position.chapter {
            let Some(content) = self.chunk_cache.peek(chunk) else {
                log::debug!("[SESSION] Ignoring report for unloaded chunk {}", chunk);
                return Ok(None);
            };
            let Some(markup) = content.get(chapter_path) else {
                return Ok(None);
            };
            self.pages = self.pages_for(chapter_path, markup, chapter);
        }

        let total = total_pages.max(1);
        self.reported_pages.insert(chapter_path.to_string(), total);
        self.position = ReaderPosition::new(chunk, chapter, page.min(total - 1));
        Ok(Some(self.settle()))
    }

    /// Persist the current position under the book's key.
    pub fn save_progress(&self) -> Result<(), ReaderError> {
        let book = self.book.as_ref().ok_or(ReaderError::NoDocument)?;
        store::set_json(
            self.library.store().as_ref(),
            &store::position_key(&book.meta.key),
            &self.position,
        )?;
        log::debug!("[STORE] Saved {:?} for {}", self.position, book.meta.key);
        Ok(())
    }

    /// Saved position of the loaded book.
    pub fn load_progress(&self) -> Result<Option<ReaderPosition>, ReaderError> {
        let book = self.book.as_ref().ok_or(ReaderError::NoDocument)?;
        Ok(store::get_json(
            self.library.store().as_ref(),
            &store::position_key(&book.meta.key),
        )?)
    }

    /// Progress through the book by page.
    pub fn reading_progress(&self) -> ReadingProgress {
        let Some(book) = self.book.as_ref() else {
            return ReadingProgress::default();
        };
        let current_global = book
            .chunks
            .global_index(self.position.chunk, self.position.chapter);

        let mut total = 0usize;
        let mut before = 0usize;
        for (idx, path) in book.chunks.all_chapters().enumerate() {
            let pages = self
                .reported_pages
                .get(path)
                .copied()
                .or_else(|| self.page_cache.page_count(path))
                .unwrap_or(1)
                .max(1);
            if idx < current_global {
                before += pages;
            }
            total += pages;
        }

        let current = (before + self.position.page + 1).min(total);
        let percentage = if total == 0 {
            0.0
        } else {
            current as f32 / total as f32 * 100.0
        };
        ReadingProgress {
            current,
            total,
            percentage,
        }
    }

    /// Close the book: drop caches and release the archive.
    pub fn close(&mut self) {
        if let Some(book) = self.book.take() {
            drop(book.archive);
            self.archives.close(&book.meta.path);
            log::info!("[SESSION] Closed '{}'", book.meta.title);
        }
        self.reset_caches();
        self.set_status(SessionStatus::Idle);
    }
}
