//! Archive handle registry
//!
//! `ArchiveReader` opens each archive identity at most once and hands out
//! cheap, cloneable `ArchiveHandle`s to it. Plain paths (and `file://`
//! identities) are opened in place. Identities with any other scheme are
//! resolved through a registered [`SourceOpener`] and copied into a
//! temporary file, which lives exactly as long as the registry entry.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::{NamedTempFile, TempPath};

use crate::error::{ArchiveError, ZipError};
use crate::zip::{StreamingZip, ZipLimits};

/// Opens a non-seekable byte stream for identities of one URI scheme.
///
/// The stream is drained into a local temporary copy before the ZIP
/// central directory is read.
pub trait SourceOpener: Send + Sync {
    /// Scheme handled by this opener, without `://` (e.g. `"content"`).
    fn scheme(&self) -> &str;

    /// Open a readable stream for `identity`.
    fn open(&self, identity: &str) -> std::io::Result<Box<dyn Read + Send>>;
}

struct ArchiveInner {
    identity: String,
    zip: Mutex<StreamingZip<File>>,
    /// Local copy of a non-seekable source, removed when the last handle drops.
    _temp: Option<TempPath>,
}

/// Shared read-only handle to one open archive.
#[derive(Clone)]
pub struct ArchiveHandle {
    inner: Arc<ArchiveInner>,
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("identity", &self.inner.identity)
            .field("temp_copy", &self.inner._temp.is_some())
            .finish()
    }
}

impl ArchiveHandle {
    /// Identity this handle was opened with.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Whether the archive is backed by a temporary local copy.
    pub fn is_temp_copy(&self) -> bool {
        self.inner._temp.is_some()
    }

    /// Read one entry's decompressed bytes.
    pub fn read_entry(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut zip = self.inner.zip.lock();
        zip.read_entry(path).map_err(|kind| self.entry_error(path, kind))
    }

    /// Read several entries under one lock; missing paths are omitted.
    pub fn read_entries<S: AsRef<str>>(
        &self,
        paths: &[S],
    ) -> Result<HashMap<String, Vec<u8>>, ArchiveError> {
        let mut zip = self.inner.zip.lock();
        let mut out = HashMap::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            match zip.read_entry(path) {
                Ok(bytes) => {
                    out.insert(path.to_string(), bytes);
                }
                Err(ZipError::FileNotFound) => {
                    log::debug!("[ARCHIVE] {} has no entry {}", self.inner.identity, path);
                }
                Err(kind) => return Err(self.entry_error(path, kind)),
            }
        }
        Ok(out)
    }

    /// Uncompressed size of every entry, keyed by path.
    pub fn entry_sizes(&self) -> HashMap<String, u64> {
        self.inner.zip.lock().entry_sizes()
    }

    fn entry_error(&self, path: &str, kind: ZipError) -> ArchiveError {
        match kind {
            ZipError::FileNotFound => ArchiveError::EntryNotFound(path.to_string()),
            kind => ArchiveError::Zip {
                identity: self.inner.identity.clone(),
                kind,
            },
        }
    }
}

/// Registry of open archives keyed by identity.
pub struct ArchiveReader {
    handles: Mutex<HashMap<String, ArchiveHandle>>,
    openers: Vec<Arc<dyn SourceOpener>>,
    limits: Option<ZipLimits>,
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveReader {
    /// Create an empty registry that only opens local paths.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            openers: Vec::new(),
            limits: None,
        }
    }

    /// Apply ZIP read limits to archives opened after this call.
    pub fn with_zip_limits(mut self, limits: Option<ZipLimits>) -> Self {
        self.limits = limits;
        self
    }

    /// Register an opener for a non-seekable URI scheme.
    pub fn with_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.openers.push(opener);
        self
    }

    /// Open `identity`, or return the cached handle if it is already open.
    pub fn open(&self, identity: &str) -> Result<ArchiveHandle, ArchiveError> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(identity) {
            return Ok(handle.clone());
        }

        let (file, temp) = self.open_source(identity)?;
        let mut zip = StreamingZip::new_with_limits(file, self.limits).map_err(|kind| {
            ArchiveError::Zip {
                identity: identity.to_string(),
                kind,
            }
        })?;

        if zip.get_entry("mimetype").is_some() {
            zip.validate_mimetype().map_err(|kind| ArchiveError::Zip {
                identity: identity.to_string(),
                kind,
            })?;
        } else {
            log::warn!("[ARCHIVE] {} has no mimetype entry", identity);
        }

        log::info!(
            "[ARCHIVE] Opened {} ({} entries{})",
            identity,
            zip.num_entries(),
            if temp.is_some() { ", temp copy" } else { "" }
        );

        let handle = ArchiveHandle {
            inner: Arc::new(ArchiveInner {
                identity: identity.to_string(),
                zip: Mutex::new(zip),
                _temp: temp,
            }),
        };
        handles.insert(identity.to_string(), handle.clone());
        Ok(handle)
    }

    /// Open `identity` and close it again when the lease drops.
    pub fn lease(&self, identity: &str) -> Result<ArchiveLease<'_>, ArchiveError> {
        let handle = self.open(identity)?;
        Ok(ArchiveLease {
            reader: self,
            handle,
        })
    }

    /// Release the registry entry for `identity`.
    ///
    /// Returns `false` when nothing was open. Outstanding handle clones keep
    /// the file alive until they drop.
    pub fn close(&self, identity: &str) -> bool {
        let removed = self.handles.lock().remove(identity);
        match removed {
            Some(handle) => {
                log::info!(
                    "[ARCHIVE] Closed {}{}",
                    identity,
                    if handle.is_temp_copy() {
                        " (temp copy released)"
                    } else {
                        ""
                    }
                );
                true
            }
            None => false,
        }
    }

    /// Release every open archive.
    pub fn close_all(&self) {
        let drained: Vec<String> = self.handles.lock().drain().map(|(id, _)| id).collect();
        for identity in drained {
            log::info!("[ARCHIVE] Closed {}", identity);
        }
    }

    /// Whether `identity` currently has a registry entry.
    pub fn is_open(&self, identity: &str) -> bool {
        self.handles.lock().contains_key(identity)
    }

    fn open_source(&self, identity: &str) -> Result<(File, Option<TempPath>), ArchiveError> {
        let unreadable = |e: std::io::Error| ArchiveError::Unreadable {
            identity: identity.to_string(),
            reason: e.to_string(),
        };

        if let Some(path) = identity.strip_prefix("file://") {
            return Ok((File::open(path).map_err(unreadable)?, None));
        }
        let Some((scheme, _)) = identity.split_once("://") else {
            return Ok((File::open(identity).map_err(unreadable)?, None));
        };

        let opener = self
            .openers
            .iter()
            .find(|o| o.scheme().eq_ignore_ascii_case(scheme))
            .ok_or_else(|| ArchiveError::UnsupportedSource(identity.to_string()))?;

        let mut stream = opener.open(identity).map_err(unreadable)?;
        let mut temp = NamedTempFile::new().map_err(unreadable)?;
        let copied = std::io::copy(&mut stream, &mut temp).map_err(unreadable)?;
        let (mut file, path) = temp.into_parts();
        file.seek(SeekFrom::Start(0)).map_err(unreadable)?;
        log::debug!(
            "[ARCHIVE] Copied {} bytes of {} to {}",
            copied,
            identity,
            path.display()
        );
        Ok((file, Some(path)))
    }
}

/// Scoped archive acquisition: the registry entry closes on drop.
pub struct ArchiveLease<'a> {
    reader: &'a ArchiveReader,
    handle: ArchiveHandle,
}

impl std::ops::Deref for ArchiveLease<'_> {
    type Target = ArchiveHandle;

    fn deref(&self) -> &ArchiveHandle {
        &self.handle
    }
}

impl Drop for ArchiveLease<'_> {
    fn drop(&mut self) {
        self.reader.close(self.handle.identity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::build_test_zip;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn write_book(dir: &tempfile::TempDir, files: &[(&str, &[u8], bool)]) -> String {
        let path = dir.path().join("book.epub");
        std::fs::write(&path, build_test_zip(files)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn sample() -> Vec<(&'static str, &'static [u8], bool)> {
        vec![
            ("mimetype", b"application/epub+zip", false),
            ("OEBPS/ch1.xhtml", b"<p>one</p>", true),
            ("OEBPS/ch2.xhtml", b"<p>two</p>", false),
        ]
    }

    struct MemoryOpener {
        bytes: Vec<u8>,
        seen: Mutex<Vec<String>>,
    }

    impl SourceOpener for MemoryOpener {
        fn scheme(&self) -> &str {
            "content"
        }

        fn open(&self, identity: &str) -> std::io::Result<Box<dyn Read + Send>> {
            self.seen.lock().push(identity.to_string());
            Ok(Box::new(Cursor::new(self.bytes.clone())))
        }
    }

    #[test]
    fn test_open_is_idempotent_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let reader = ArchiveReader::new();
        let a = reader.open(&path).unwrap();
        let b = reader.open(&path).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(reader.is_open(&path));
    }

    #[test]
    fn test_read_entries_omits_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let reader = ArchiveReader::new();
        let handle = reader.open(&path).unwrap();
        let got = handle
            .read_entries(&["OEBPS/ch1.xhtml", "OEBPS/missing.xhtml", "OEBPS/ch2.xhtml"])
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["OEBPS/ch1.xhtml"], b"<p>one</p>");
        assert_eq!(got["OEBPS/ch2.xhtml"], b"<p>two</p>");
    }

    #[test]
    fn test_read_entry_missing_is_entry_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let handle = ArchiveReader::new().open(&path).unwrap();
        assert_eq!(
            handle.read_entry("nope.xhtml"),
            Err(ArchiveError::EntryNotFound("nope.xhtml".into()))
        );
    }

    #[test]
    fn test_entry_sizes_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let sizes = ArchiveReader::new().open(&path).unwrap().entry_sizes();
        assert_eq!(sizes.get("OEBPS/ch1.xhtml"), Some(&10));
        assert_eq!(sizes.len(), 3);
    }

    #[test]
    fn test_file_uri_opens_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let identity = format!("file://{}", path);
        let handle = ArchiveReader::new().open(&identity).unwrap();
        assert!(!handle.is_temp_copy());
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = ArchiveReader::new().open("/definitely/not/here.epub").unwrap_err();
        assert!(matches!(err, ArchiveError::Unreadable { .. }));
    }

    #[test]
    fn test_garbage_is_zip_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.epub");
        std::fs::write(&path, b"not a zip, just some bytes to read").unwrap();
        let err = ArchiveReader::new()
            .open(path.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Zip {
                kind: ZipError::InvalidFormat,
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_mimetype_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &[("mimetype", b"application/zip", false)]);
        let err = ArchiveReader::new().open(&path).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Zip {
                kind: ZipError::InvalidMimetype(_),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_scheme_unsupported() {
        let err = ArchiveReader::new().open("content://books/1").unwrap_err();
        assert_eq!(
            err,
            ArchiveError::UnsupportedSource("content://books/1".into())
        );
    }

    #[test]
    fn test_temp_copy_deleted_on_close() {
        let opener = Arc::new(MemoryOpener {
            bytes: build_test_zip(&sample()),
            seen: Mutex::new(Vec::new()),
        });
        let reader = ArchiveReader::new().with_opener(opener.clone());
        let identity = "content://books/1";

        let handle = reader.open(identity).unwrap();
        assert!(handle.is_temp_copy());
        let temp: PathBuf = handle.inner._temp.as_ref().unwrap().to_path_buf();
        assert!(temp.exists());
        assert_eq!(handle.read_entry("OEBPS/ch2.xhtml").unwrap(), b"<p>two</p>");

        // Second open reuses the copy.
        reader.open(identity).unwrap();
        assert_eq!(opener.seen.lock().len(), 1);

        drop(handle);
        assert!(reader.close(identity));
        assert!(!temp.exists());
        assert!(!reader.close(identity));
    }

    #[test]
    fn test_lease_closes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let reader = ArchiveReader::new();
        {
            let lease = reader.lease(&path).unwrap();
            assert_eq!(lease.read_entry("OEBPS/ch1.xhtml").unwrap(), b"<p>one</p>");
            assert!(reader.is_open(&path));
        }
        assert!(!reader.is_open(&path));
    }

    #[test]
    fn test_close_all_empties_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(&dir, &sample());
        let reader = ArchiveReader::new();
        reader.open(&path).unwrap();
        reader.close_all();
        assert!(!reader.is_open(&path));
    }
}
