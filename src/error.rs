//! Unified error types for calico
//!
//! Each pipeline stage has its own error enum; `ReaderError` wraps them all
//! with `From` impls so `?` works across module boundaries. Every type is
//! `Clone` so a session can keep its failure cause in its status.

use thiserror::Error;

/// ZIP-specific error variants
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ZipErrorKind {
    /// File not found in archive
    #[error("file not found in archive")]
    FileNotFound,
    /// Invalid ZIP format
    #[error("invalid ZIP format")]
    InvalidFormat,
    /// Unsupported compression method
    #[error("unsupported compression method")]
    UnsupportedCompression,
    /// Decompression failed
    #[error("decompression failed")]
    DecompressError,
    /// CRC32 mismatch
    #[error("CRC32 checksum mismatch")]
    CrcMismatch,
    /// I/O error during ZIP operations
    #[error("I/O error")]
    IoError,
    /// File exceeds maximum allowed size
    #[error("file too large")]
    FileTooLarge,
    /// Invalid or missing mimetype file
    #[error("invalid mimetype: {0}")]
    InvalidMimetype(String),
    /// ZIP64 structures are present but unsupported
    #[error("ZIP64 is not supported")]
    UnsupportedZip64,
}

/// Public ZIP error type alias used across the crate API.
pub type ZipError = ZipErrorKind;

/// The archive source could not be opened or read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// The source could not be read (missing file, permission, stream failure).
    #[error("cannot read archive source '{identity}': {reason}")]
    Unreadable {
        /// Archive identity as passed to `open`.
        identity: String,
        /// I/O error description.
        reason: String,
    },
    /// No registered opener handles the identity's scheme.
    #[error("unsupported archive source: {0}")]
    UnsupportedSource(String),
    /// The source is not a valid ZIP container.
    #[error("invalid archive '{identity}': {kind}")]
    Zip {
        /// Archive identity as passed to `open`.
        identity: String,
        /// Underlying ZIP failure.
        kind: ZipError,
    },
    /// The requested entry is not present.
    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),
}

/// Missing or malformed container descriptor or package document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StructureError {
    /// `container.xml` has no `<rootfile full-path>`.
    #[error("container.xml malformed")]
    ContainerMalformed,
    /// `META-INF/container.xml` is absent from the archive.
    #[error("container.xml not found")]
    ContainerMissing,
    /// The package document named by `container.xml` is absent.
    #[error("package document not found: {0}")]
    PackageMissing(String),
    /// XML could not be parsed.
    #[error("XML parse error: {0}")]
    Xml(String),
}

/// Required package metadata is absent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MetadataError {
    /// A required Dublin Core field is missing or empty.
    #[error("required metadata field missing: {0}")]
    MissingField(&'static str),
}

/// A chunk could not be loaded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ChunkLoadError {
    /// The chunk index is not part of the chunk map.
    #[error("chunk {0} does not exist")]
    UnknownChunk(usize),
    /// A chapter of the chunk is absent from the archive.
    #[error("chunk {chunk}: chapter '{path}' not found in archive")]
    MissingChapter {
        /// Chunk index.
        chunk: usize,
        /// Archive entry path.
        path: String,
    },
    /// A chapter of the chunk is not valid UTF-8.
    #[error("chunk {chunk}: chapter '{path}' is not valid UTF-8")]
    Decode {
        /// Chunk index.
        chunk: usize,
        /// Archive entry path.
        path: String,
    },
    /// The batched archive read failed.
    #[error("chunk {chunk}: {source}")]
    Archive {
        /// Chunk index.
        chunk: usize,
        /// Underlying archive failure.
        source: ArchiveError,
    },
    /// The blocking read task was cancelled or panicked.
    #[error("chunk {chunk}: load task aborted")]
    Aborted {
        /// Chunk index.
        chunk: usize,
    },
}

/// Markup could not be segmented into pages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PaginationError {
    /// Markup exceeded the word budget but contained no block-level units.
    #[error("chapter has no block-level units to paginate")]
    NoBlockUnits,
}

/// Persistence store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing storage failed.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A record could not be encoded or decoded.
    #[error("store record '{key}' is invalid: {reason}")]
    Serialization {
        /// Store key of the record.
        key: String,
        /// serde_json error description.
        reason: String,
    },
}

/// An inbound surface message could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Neither a navigation intent nor a position report.
    #[error("unrecognized inbound message: {0}")]
    Unrecognized(String),
}

/// Top-level error type for calico operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReaderError {
    /// Archive error
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Container/package structure error
    #[error(transparent)]
    Structure(#[from] StructureError),
    /// Metadata error
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Chunk load error
    #[error(transparent)]
    ChunkLoad(#[from] ChunkLoadError),
    /// Pagination error
    #[error(transparent)]
    Pagination(#[from] PaginationError),
    /// Persistence error
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Inbound message error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// No metadata record exists for the book key.
    #[error("book not found: {0}")]
    BookNotFound(String),
    /// A book with the same key is already in the library.
    #[error("book already exists in library: {0}")]
    DuplicateBook(String),
    /// Navigation was requested before a document was loaded.
    #[error("no document loaded")]
    NoDocument,
    /// The session task has shut down.
    #[error("reader session closed")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_error_display() {
        let err = StructureError::ContainerMalformed;
        assert_eq!(err.to_string(), "container.xml malformed");
    }

    #[test]
    fn test_zip_error_kind_debug() {
        let kind = ZipErrorKind::FileNotFound;
        assert_eq!(format!("{:?}", kind), "FileNotFound");
    }

    #[test]
    fn test_reader_error_is_transparent() {
        let err: ReaderError = MetadataError::MissingField("title").into();
        assert_eq!(err.to_string(), "required metadata field missing: title");
    }

    #[test]
    fn test_chunk_load_error_carries_archive_cause() {
        let err = ChunkLoadError::Archive {
            chunk: 3,
            source: ArchiveError::EntryNotFound("a.xhtml".into()),
        };
        assert_eq!(
            err.to_string(),
            "chunk 3: entry not found in archive: a.xhtml"
        );
    }

    #[test]
    fn test_archive_zip_error_display() {
        let err = ArchiveError::Zip {
            identity: "book.epub".into(),
            kind: ZipError::InvalidFormat,
        };
        assert_eq!(err.to_string(), "invalid archive 'book.epub': invalid ZIP format");
    }
}
