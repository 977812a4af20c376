//! Book import and the persisted library registry
//!
//! Importing reads only the container descriptor and the package document.
//! Chunk maps are planned lazily the first time a book is opened for
//! reading, then written back to the book's record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveHandle, ArchiveReader};
use crate::chunk::{plan_with_sizes, ChunkMap};
use crate::error::{ArchiveError, ReaderError, StructureError};
use crate::metadata::{find_package_path, parse_metadata, CONTAINER_PATH};
use crate::spine::parse_spine_order;
use crate::store::{self, KeyValueStore};

/// Persisted record of one imported book
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Stable content key (see [`book_key`])
    pub key: String,
    /// Title
    pub title: String,
    /// Author
    pub author: String,
    /// Description, possibly empty
    #[serde(default)]
    pub description: String,
    /// Genres in package-document order
    #[serde(default)]
    pub genres: Vec<String>,
    /// Archive identity the book was imported from
    pub path: String,
    /// Chunk plan, absent until the book is first read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<ChunkMap>,
}

/// Stable key for a title: hex SHA-1 of the trimmed, lowercased title.
pub fn book_key(title: &str) -> String {
    let normalized = title.trim().to_lowercase();
    sha1_smol::Sha1::from(normalized.as_bytes()).digest().to_string()
}

/// Run `f` against `identity`, closing the archive afterwards unless it was
/// already open.
fn with_archive<T>(
    archives: &ArchiveReader,
    identity: &str,
    f: impl FnOnce(&ArchiveHandle) -> Result<T, ReaderError>,
) -> Result<T, ReaderError> {
    if archives.is_open(identity) {
        let handle = archives.open(identity)?;
        f(&handle)
    } else {
        let lease = archives.lease(identity)?;
        f(&lease)
    }
}

/// Read the package document: its archive path and raw bytes.
pub fn read_package(handle: &ArchiveHandle) -> Result<(String, Vec<u8>), ReaderError> {
    let container = handle.read_entry(CONTAINER_PATH).map_err(|e| match e {
        ArchiveError::EntryNotFound(_) => ReaderError::from(StructureError::ContainerMissing),
        other => other.into(),
    })?;
    let package_path = find_package_path(&container)?;
    let package = handle.read_entry(&package_path).map_err(|e| match e {
        ArchiveError::EntryNotFound(path) => {
            ReaderError::from(StructureError::PackageMissing(path))
        }
        other => other.into(),
    })?;
    Ok((package_path, package))
}

/// Parse the metadata of the archive at `identity` into a new book record.
///
/// The record's chunk map is left empty.
pub fn import_metadata(
    archives: &ArchiveReader,
    identity: &str,
) -> Result<BookMetadata, ReaderError> {
    with_archive(archives, identity, |handle| {
        let (_, package) = read_package(handle)?;
        let meta = parse_metadata(&package)?;
        let key = book_key(&meta.title);
        log::info!(
            "[LIBRARY] Imported '{}' by {} as {}",
            meta.title,
            meta.author,
            key
        );
        Ok(BookMetadata {
            key,
            title: meta.title,
            author: meta.author,
            description: meta.description,
            genres: meta.genres,
            path: identity.to_string(),
            chunks: None,
        })
    })
}

/// Alias of [`import_metadata`].
pub fn parse_epub(archives: &ArchiveReader, identity: &str) -> Result<BookMetadata, ReaderError> {
    import_metadata(archives, identity)
}

/// Plan the chunk map of an open archive from its spine and entry sizes.
pub fn plan_book_chunks(
    handle: &ArchiveHandle,
    max_chunk_bytes: u64,
) -> Result<ChunkMap, ReaderError> {
    let (package_path, package) = read_package(handle)?;
    let spine = parse_spine_order(&package, &package_path)?;
    let sizes = handle.entry_sizes();
    Ok(plan_with_sizes(&spine, &sizes, max_chunk_bytes))
}

/// Book records over a key-value store
///
/// Records live under `books:{key}`; `books:all` holds the ordered key index.
#[derive(Clone)]
pub struct Library {
    store: Arc<dyn KeyValueStore>,
}

impl Library {
    /// Create a library over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn index(&self) -> Result<Vec<String>, ReaderError> {
        let keys = store::get_json::<Vec<String>>(self.store.as_ref(), store::BOOK_INDEX_KEY)?;
        Ok(keys.unwrap_or_default())
    }

    fn write_index(&self, keys: &[String]) -> Result<(), ReaderError> {
        Ok(store::set_json(self.store.as_ref(), store::BOOK_INDEX_KEY, keys)?)
    }

    /// Add a new book; fails with `DuplicateBook` if its key exists.
    pub fn add(&self, book: &BookMetadata) -> Result<(), ReaderError> {
        let record_key = store::book_record_key(&book.key);
        if self.store.has(&record_key)? {
            return Err(ReaderError::DuplicateBook(book.key.clone()));
        }
        store::set_json(self.store.as_ref(), &record_key, book)?;

        let mut keys = self.index()?;
        if !keys.contains(&book.key) {
            keys.push(book.key.clone());
            self.write_index(&keys)?;
        }
        log::info!("[STORE] Added book {} ({})", book.key, book.title);
        Ok(())
    }

    /// Import the archive at `identity` and add it.
    pub fn import(
        &self,
        archives: &ArchiveReader,
        identity: &str,
    ) -> Result<BookMetadata, ReaderError> {
        let book = import_metadata(archives, identity)?;
        self.add(&book)?;
        Ok(book)
    }

    /// Book record for `key`.
    pub fn get(&self, key: &str) -> Result<BookMetadata, ReaderError> {
        store::get_json(self.store.as_ref(), &store::book_record_key(key))?
            .ok_or_else(|| ReaderError::BookNotFound(key.to_string()))
    }

    /// Every book in index order. Index keys without a record are skipped.
    pub fn list(&self) -> Result<Vec<BookMetadata>, ReaderError> {
        let mut books = Vec::new();
        for key in self.index()? {
            let record_key = store::book_record_key(&key);
            match store::get_json::<BookMetadata>(self.store.as_ref(), &record_key)? {
                Some(book) => books.push(book),
                None => log::warn!("[STORE] Index lists {} but it has no record", key),
            }
        }
        Ok(books)
    }

    /// Overwrite an existing book record.
    pub fn update(&self, book: &BookMetadata) -> Result<(), ReaderError> {
        let record_key = store::book_record_key(&book.key);
        if !self.store.has(&record_key)? {
            return Err(ReaderError::BookNotFound(book.key.clone()));
        }
        store::set_json(self.store.as_ref(), &record_key, book)?;
        log::debug!("[STORE] Updated book {}", book.key);
        Ok(())
    }

    /// Remove a book's record, saved position and index entry.
    pub fn remove(&self, key: &str) -> Result<(), ReaderError> {
        let record_key = store::book_record_key(key);
        if !self.store.has(&record_key)? {
            return Err(ReaderError::BookNotFound(key.to_string()));
        }
        self.store.delete(&record_key)?;
        self.store.delete(&store::position_key(key))?;

        let mut keys = self.index()?;
        keys.retain(|k| k != key);
        self.write_index(&keys)?;
        log::info!("[STORE] Removed book {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn book(title: &str) -> BookMetadata {
        BookMetadata {
            key: book_key(title),
            title: title.to_string(),
            author: "Author".into(),
            description: String::new(),
            genres: vec!["Fiction".into()],
            path: format!("/books/{}.epub", title),
            chunks: None,
        }
    }

    fn library() -> Library {
        Library::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_book_key_normalizes_title() {
        assert_eq!(book_key("  Dune "), book_key("dune"));
        assert_eq!(book_key("DUNE"), "9dc0593cda2fafb505c76eeec65dd0640264f669");
        assert_ne!(book_key("dune"), book_key("dune messiah"));
    }

    #[test]
    fn test_add_and_list_in_order() {
        let lib = library();
        lib.add(&book("B")).unwrap();
        lib.add(&book("A")).unwrap();
        let titles: Vec<String> = lib.list().unwrap().into_iter().map(|b| b.title).collect();
        assert_eq!(titles, vec!["B", "A"]);
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let lib = library();
        lib.add(&book("Dune")).unwrap();
        let err = lib.add(&book("dune")).unwrap_err();
        assert_eq!(err, ReaderError::DuplicateBook(book_key("Dune")));
        assert_eq!(lib.list().unwrap().len(), 1);
    }

    #[test]
    fn test_record_layout_without_chunks() {
        let lib = library();
        let b = book("Dune");
        lib.add(&b).unwrap();
        let raw = lib.store().get(&store::book_record_key(&b.key)).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["title"], "Dune");
        assert_eq!(value["genres"][0], "Fiction");
        assert!(value.get("chunks").is_none());
    }

    #[test]
    fn test_update_and_remove() {
        let lib = library();
        let mut b = book("Dune");
        lib.add(&b).unwrap();
        b.description = "Spice".into();
        lib.update(&b).unwrap();
        assert_eq!(lib.get(&b.key).unwrap().description, "Spice");

        lib.store().set(&store::position_key(&b.key), b"{}").unwrap();
        lib.remove(&b.key).unwrap();
        assert_eq!(lib.get(&b.key), Err(ReaderError::BookNotFound(b.key.clone())));
        assert!(!lib.store().has(&store::position_key(&b.key)).unwrap());
        assert!(lib.list().unwrap().is_empty());
        assert!(lib.remove(&b.key).is_err());
    }

    #[test]
    fn test_list_skips_dangling_keys() {
        let lib = library();
        lib.add(&book("A")).unwrap();
        store::set_json(
            lib.store().as_ref(),
            store::BOOK_INDEX_KEY,
            &vec![book_key("A"), "ghost".to_string()],
        )
        .unwrap();
        assert_eq!(lib.list().unwrap().len(), 1);
    }
}
