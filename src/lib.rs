//! calico -- chunked, paginated EPUB reading engine
//!
//! Opens EPUB archives, parses their container and package documents,
//! partitions the spine into size-bounded chunks for lazy loading, and
//! paginates chapter markup into screen-sized pages. [`ReaderSession`]
//! drives chunk -> chapter -> page navigation and persists the reading
//! position through a [`KeyValueStore`].
//!
//! # Features
//!
//! - `cli` -- builds the `calico` command-line tool
//!
//! # Loading Behavior
//!
//! Only the container, package document and ZIP central directory are read
//! when a book is imported. Chapter bodies are read one chunk at a time,
//! in a single batched archive read on tokio's blocking pool, and kept in
//! a small LRU cache alongside the paginated chapters.

#![warn(missing_docs)]
#![deny(clippy::large_enum_variant, clippy::large_stack_arrays, clippy::redundant_clone)]
#![warn(
    clippy::box_collection,
    clippy::needless_collect,
    clippy::map_clone,
    clippy::implicit_clone,
    clippy::inefficient_to_string
)]

pub mod archive;
pub mod async_api;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod layout;
pub mod library;
pub mod metadata;
pub mod protocol;
pub mod session;
pub mod spine;
pub mod store;
pub mod zip;

// Re-export key types for convenience
pub use archive::{ArchiveHandle, ArchiveLease, ArchiveReader, SourceOpener};
pub use async_api::{
    import_metadata_async, load_chunk_async, open_archive_async, plan_book_chunks_async,
};
pub use cache::{ChunkCache, ChunkContent, PageCache};
pub use chunk::{plan, plan_with_sizes, Chunk, ChunkMap, DEFAULT_MAX_CHUNK_BYTES};
pub use config::ReaderConfig;
pub use error::{
    ArchiveError, ChunkLoadError, MetadataError, PaginationError, ProtocolError, ReaderError,
    StoreError, StructureError, ZipError, ZipErrorKind,
};
pub use layout::{
    count_words, estimate_page_budget, paginate, split_block_units, try_paginate, Page,
    PaginationConfig, Viewport,
};
pub use library::{book_key, import_metadata, parse_epub, BookMetadata, Library};
pub use metadata::{find_package_path, parse_metadata, PackageMetadata};
pub use protocol::{
    Dispatched, InboundMessage, NavigationIntent, PositionReport, SessionHandle, SessionSnapshot,
};
pub use session::{
    plan_next, plan_prev, Boundary, NavOutcome, ReaderPosition, ReaderSession, ReadingProgress,
    SessionStatus,
};
pub use spine::{parse_spine_order, resolve_href};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use zip::{StreamingZip, ZipLimits};
