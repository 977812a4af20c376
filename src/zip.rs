//! Streaming ZIP reader for EPUB files
//!
//! Parses the central directory once, then reads individual entries on
//! demand by seeking to their local headers. Supports stored and DEFLATE
//! entries (miniz_oxide), verifies CRC32 on every read.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use miniz_oxide::{DataFormat, MZFlush, MZStatus};

pub use crate::error::ZipError;

/// Local file header signature (little-endian)
const SIG_LOCAL_FILE_HEADER: u32 = 0x04034b50;
/// Central directory entry signature (little-endian)
const SIG_CD_ENTRY: u32 = 0x02014b50;
/// End of central directory signature (little-endian)
const SIG_EOCD: u32 = 0x06054b50;
/// ZIP64 end of central directory locator signature (little-endian)
const SIG_ZIP64_EOCD_LOCATOR: u32 = 0x07064b50;
/// Minimum EOCD record size in bytes
const EOCD_MIN_SIZE: usize = 22;
/// Maximum EOCD search window (EOCD + max comment length)
const MAX_EOCD_SCAN: usize = EOCD_MIN_SIZE + u16::MAX as usize;

/// Compression methods
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Scratch size for chunked reads and inflate output
const SCRATCH_SIZE: usize = 8 * 1024;
/// Upper bound on output preallocated from a header-declared size
const MAX_PREALLOC: usize = 128 * SCRATCH_SIZE;

/// Runtime-configurable ZIP safety limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ZipLimits {
    /// Maximum compressed or uncompressed file size allowed for reads.
    pub max_file_read_size: usize,
    /// Maximum allowed size for the `mimetype` entry.
    pub max_mimetype_size: usize,
}

impl ZipLimits {
    /// Create explicit ZIP limits.
    pub fn new(max_file_read_size: usize, max_mimetype_size: usize) -> Self {
        Self {
            max_file_read_size,
            max_mimetype_size,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EocdInfo {
    cd_offset: u64,
    cd_size: u32,
    num_entries: u16,
    uses_zip64: bool,
}

/// Central directory entry metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdEntry {
    /// Compression method (0=stored, 8=deflated)
    pub method: u16,
    /// Compressed size in bytes
    pub compressed_size: u32,
    /// Uncompressed size in bytes
    pub uncompressed_size: u32,
    /// Offset to local file header
    pub local_header_offset: u32,
    /// CRC32 checksum
    pub crc32: u32,
    /// Entry path inside the archive
    pub filename: String,
}

/// Streaming ZIP file reader
pub struct StreamingZip<F: Read + Seek> {
    file: F,
    entries: Vec<CdEntry>,
    /// Entry path -> index into `entries`
    by_name: HashMap<String, usize>,
    limits: Option<ZipLimits>,
}

impl<F: Read + Seek> StreamingZip<F> {
    /// Open a ZIP file and parse the central directory
    pub fn new(file: F) -> Result<Self, ZipError> {
        Self::new_with_limits(file, None)
    }

    /// Open a ZIP file with explicit runtime limits.
    pub fn new_with_limits(mut file: F, limits: Option<ZipLimits>) -> Result<Self, ZipError> {
        let eocd = Self::find_eocd(&mut file)?;
        if eocd.uses_zip64 {
            return Err(ZipError::UnsupportedZip64);
        }

        file.seek(SeekFrom::Start(eocd.cd_offset))
            .map_err(|_| ZipError::IoError)?;
        let cd_end = eocd.cd_offset + eocd.cd_size as u64;

        let mut entries = Vec::with_capacity(eocd.num_entries as usize);
        for _ in 0..eocd.num_entries {
            let pos = file.stream_position().map_err(|_| ZipError::IoError)?;
            if pos >= cd_end {
                break;
            }
            match Self::read_cd_entry(&mut file)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }

        if entries.len() < eocd.num_entries as usize {
            log::warn!(
                "[ZIP] Central directory declares {} entries but only {} were readable",
                eocd.num_entries,
                entries.len()
            );
        }
        log::debug!(
            "[ZIP] Parsed {} central directory entries (offset {})",
            entries.len(),
            eocd.cd_offset
        );

        let by_name = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.filename.clone(), idx))
            .collect();

        Ok(Self {
            file,
            entries,
            by_name,
            limits,
        })
    }

    /// Find EOCD and extract central directory info
    fn find_eocd(file: &mut F) -> Result<EocdInfo, ZipError> {
        let file_size = file.seek(SeekFrom::End(0)).map_err(|_| ZipError::IoError)?;
        if file_size < EOCD_MIN_SIZE as u64 {
            return Err(ZipError::InvalidFormat);
        }

        // Scan last (EOCD + max comment) bytes for EOCD signature.
        let scan_range = file_size.min(MAX_EOCD_SCAN as u64) as usize;
        let mut buffer = vec![0u8; scan_range];
        file.seek(SeekFrom::Start(file_size - scan_range as u64))
            .map_err(|_| ZipError::IoError)?;
        file.read_exact(&mut buffer).map_err(|_| ZipError::IoError)?;
        let scan_base = file_size - scan_range as u64;

        for i in (0..=scan_range - EOCD_MIN_SIZE).rev() {
            if read_u32_le(&buffer, i) != SIG_EOCD {
                continue;
            }
            let num_entries = read_u16_le(&buffer, i + 10);
            let cd_size = read_u32_le(&buffer, i + 12);
            let cd_offset = read_u32_le(&buffer, i + 16) as u64;
            let comment_len = read_u16_le(&buffer, i + 20) as u64;
            let eocd_pos = scan_base + i as u64;
            if eocd_pos + EOCD_MIN_SIZE as u64 + comment_len != file_size {
                continue;
            }

            let cd_end = cd_offset
                .checked_add(cd_size as u64)
                .ok_or(ZipError::InvalidFormat)?;
            if cd_end > eocd_pos {
                return Err(ZipError::InvalidFormat);
            }

            let uses_zip64_sentinel =
                num_entries == u16::MAX || cd_size == u32::MAX || cd_offset == u32::MAX as u64;
            let uses_zip64_locator = eocd_pos >= scan_base + 20
                && read_u32_le(&buffer, (eocd_pos - 20 - scan_base) as usize)
                    == SIG_ZIP64_EOCD_LOCATOR;

            return Ok(EocdInfo {
                cd_offset,
                cd_size,
                num_entries,
                uses_zip64: uses_zip64_sentinel || uses_zip64_locator,
            });
        }

        Err(ZipError::InvalidFormat)
    }

    /// Read a central directory entry from file
    fn read_cd_entry(file: &mut F) -> Result<Option<CdEntry>, ZipError> {
        let mut sig_buf = [0u8; 4];
        if file.read_exact(&mut sig_buf).is_err() {
            return Ok(None);
        }
        if u32::from_le_bytes(sig_buf) != SIG_CD_ENTRY {
            return Ok(None);
        }

        // Fixed portion after the signature; buf[N] is CD offset N + 4.
        let mut buf = [0u8; 42];
        file.read_exact(&mut buf).map_err(|_| ZipError::IoError)?;

        let method = read_u16_le(&buf, 6);
        let crc32 = read_u32_le(&buf, 12);
        let compressed_size = read_u32_le(&buf, 16);
        let uncompressed_size = read_u32_le(&buf, 20);
        let name_len = read_u16_le(&buf, 24) as usize;
        let extra_len = read_u16_le(&buf, 26) as i64;
        let comment_len = read_u16_le(&buf, 28) as i64;
        let local_header_offset = read_u32_le(&buf, 38);

        let mut name_buf = vec![0u8; name_len];
        file.read_exact(&mut name_buf)
            .map_err(|_| ZipError::IoError)?;
        file.seek(SeekFrom::Current(extra_len + comment_len))
            .map_err(|_| ZipError::IoError)?;

        Ok(Some(CdEntry {
            method,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            crc32,
            filename: String::from_utf8_lossy(&name_buf).into_owned(),
        }))
    }

    /// Get entry by path.
    ///
    /// Exact match first, then a case-insensitive match that also ignores a
    /// leading `/` on either side.
    pub fn get_entry(&self, name: &str) -> Option<&CdEntry> {
        if let Some(&idx) = self.by_name.get(name) {
            return self.entries.get(idx);
        }
        let wanted = name.trim_start_matches('/');
        self.entries
            .iter()
            .find(|e| e.filename.trim_start_matches('/').eq_ignore_ascii_case(wanted))
    }

    /// Read and decompress a whole entry by path.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ZipError> {
        let entry = self.get_entry(name).cloned().ok_or(ZipError::FileNotFound)?;
        let mut out = Vec::with_capacity(prealloc_len(&entry));
        self.read_file_to_writer(&entry, &mut out)?;
        Ok(out)
    }

    /// Stream a file's decompressed bytes into an arbitrary writer.
    pub fn read_file_to_writer<W: Write>(
        &mut self,
        entry: &CdEntry,
        writer: &mut W,
    ) -> Result<usize, ZipError> {
        if let Some(limits) = self.limits {
            if entry.uncompressed_size as usize > limits.max_file_read_size
                || entry.compressed_size as usize > limits.max_file_read_size
            {
                return Err(ZipError::FileTooLarge);
            }
        }

        let data_offset = self.calc_data_offset(entry)?;
        self.file
            .seek(SeekFrom::Start(data_offset))
            .map_err(|_| ZipError::IoError)?;

        let mut input_buf = vec![0u8; SCRATCH_SIZE];
        let mut hasher = crc32fast::Hasher::new();
        let written = match entry.method {
            METHOD_STORED => {
                let mut remaining = entry.compressed_size as usize;
                let mut written = 0usize;
                while remaining > 0 {
                    let take = remaining.min(input_buf.len());
                    self.file
                        .read_exact(&mut input_buf[..take])
                        .map_err(|_| ZipError::IoError)?;
                    writer
                        .write_all(&input_buf[..take])
                        .map_err(|_| ZipError::IoError)?;
                    hasher.update(&input_buf[..take]);
                    written += take;
                    remaining -= take;
                }
                written
            }
            METHOD_DEFLATED => self.inflate_to_writer(entry, writer, &mut input_buf, &mut hasher)?,
            _ => return Err(ZipError::UnsupportedCompression),
        };

        if entry.crc32 != 0 && hasher.finalize() != entry.crc32 {
            return Err(ZipError::CrcMismatch);
        }
        Ok(written)
    }

    fn inflate_to_writer<W: Write>(
        &mut self,
        entry: &CdEntry,
        writer: &mut W,
        input_buf: &mut [u8],
        hasher: &mut crc32fast::Hasher,
    ) -> Result<usize, ZipError> {
        let mut state = Box::new(miniz_oxide::inflate::stream::InflateState::new(
            DataFormat::Raw,
        ));
        let mut output_buf = vec![0u8; SCRATCH_SIZE];
        let mut compressed_remaining = entry.compressed_size as usize;
        let mut pending_start = 0usize;
        let mut pending_end = 0usize;
        let mut written = 0usize;

        loop {
            if pending_start == pending_end && compressed_remaining > 0 {
                let take = compressed_remaining.min(input_buf.len());
                self.file
                    .read_exact(&mut input_buf[..take])
                    .map_err(|_| ZipError::IoError)?;
                pending_start = 0;
                pending_end = take;
                compressed_remaining -= take;
            }

            // Finish on a first call demands the whole output fit in one buffer.
            let result = miniz_oxide::inflate::stream::inflate(
                &mut state,
                &input_buf[pending_start..pending_end],
                &mut output_buf,
                MZFlush::None,
            );
            pending_start += result.bytes_consumed;

            if result.bytes_written > 0 {
                let produced = &output_buf[..result.bytes_written];
                writer.write_all(produced).map_err(|_| ZipError::IoError)?;
                hasher.update(produced);
                written += produced.len();
            }

            match result.status {
                Ok(MZStatus::StreamEnd) => {
                    if compressed_remaining != 0 || pending_start != pending_end {
                        return Err(ZipError::DecompressError);
                    }
                    return Ok(written);
                }
                Ok(MZStatus::Ok) => {
                    if result.bytes_consumed == 0 && result.bytes_written == 0 {
                        return Err(ZipError::DecompressError);
                    }
                }
                Ok(MZStatus::NeedDict) | Err(_) => return Err(ZipError::DecompressError),
            }
        }
    }

    /// Calculate the offset to the actual file data (past local header)
    fn calc_data_offset(&mut self, entry: &CdEntry) -> Result<u64, ZipError> {
        let offset = entry.local_header_offset as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| ZipError::IoError)?;

        let mut header = [0u8; 30];
        self.file
            .read_exact(&mut header)
            .map_err(|_| ZipError::IoError)?;
        if read_u32_le(&header, 0) != SIG_LOCAL_FILE_HEADER {
            return Err(ZipError::InvalidFormat);
        }

        let name_len = read_u16_le(&header, 26) as u64;
        let extra_len = read_u16_le(&header, 28) as u64;
        Ok(offset + 30 + name_len + extra_len)
    }

    /// Validate that the archive's `mimetype` entry is `application/epub+zip`.
    pub fn validate_mimetype(&mut self) -> Result<(), ZipError> {
        let entry = self
            .get_entry("mimetype")
            .cloned()
            .ok_or_else(|| ZipError::InvalidMimetype("mimetype file not found in archive".into()))?;

        if let Some(limits) = self.limits {
            if entry.uncompressed_size as usize > limits.max_mimetype_size {
                return Err(ZipError::InvalidMimetype("mimetype file too large".into()));
            }
        }

        let mut buf = Vec::with_capacity(prealloc_len(&entry));
        self.read_file_to_writer(&entry, &mut buf)?;
        let content = std::str::from_utf8(&buf)
            .map_err(|_| ZipError::InvalidMimetype("mimetype file is not valid UTF-8".into()))?;

        if content.trim_end() != "application/epub+zip" {
            return Err(ZipError::InvalidMimetype(format!(
                "expected 'application/epub+zip', got '{}'",
                content
            )));
        }
        Ok(())
    }

    /// Uncompressed size of every entry, keyed by path.
    pub fn entry_sizes(&self) -> HashMap<String, u64> {
        self.entries
            .iter()
            .map(|e| (e.filename.clone(), e.uncompressed_size as u64))
            .collect()
    }

    /// Number of readable central directory entries
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over all entries
    pub fn entries(&self) -> impl Iterator<Item = &CdEntry> {
        self.entries.iter()
    }
}

/// Declared sizes are untrusted until the bytes are read.
fn prealloc_len(entry: &CdEntry) -> usize {
    (entry.uncompressed_size as usize).min(MAX_PREALLOC)
}

fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Write a minimal ZIP archive in memory (test fixtures only).
#[cfg(test)]
pub(crate) fn build_test_zip(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
    let mut zip = Vec::new();
    let mut central = Vec::new();

    for (name, content, deflate) in files {
        let name_bytes = name.as_bytes();
        let crc = crc32fast::hash(content);
        let (method, data) = if *deflate {
            (
                METHOD_DEFLATED,
                miniz_oxide::deflate::compress_to_vec(content, 6),
            )
        } else {
            (METHOD_STORED, content.to_vec())
        };
        let local_offset = zip.len() as u32;

        zip.extend_from_slice(&SIG_LOCAL_FILE_HEADER.to_le_bytes());
        zip.extend_from_slice(&20u16.to_le_bytes()); // version needed
        zip.extend_from_slice(&0u16.to_le_bytes()); // flags
        zip.extend_from_slice(&method.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes()); // mod time + date
        zip.extend_from_slice(&crc.to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(content.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes()); // extra length
        zip.extend_from_slice(name_bytes);
        zip.extend_from_slice(&data);

        central.extend_from_slice(&SIG_CD_ENTRY.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes()); // version made by
        central.extend_from_slice(&20u16.to_le_bytes()); // version needed
        central.extend_from_slice(&0u16.to_le_bytes()); // flags
        central.extend_from_slice(&method.to_le_bytes());
        central.extend_from_slice(&0u32.to_le_bytes()); // mod time + date
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(content.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes()); // extra length
        central.extend_from_slice(&0u16.to_le_bytes()); // comment length
        central.extend_from_slice(&0u16.to_le_bytes()); // disk number start
        central.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        central.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        central.extend_from_slice(&local_offset.to_le_bytes());
        central.extend_from_slice(name_bytes);
    }

    let cd_offset = zip.len() as u32;
    let cd_size = central.len() as u32;
    let count = files.len() as u16;
    zip.extend_from_slice(&central);
    zip.extend_from_slice(&SIG_EOCD.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes()); // disk number
    zip.extend_from_slice(&0u16.to_le_bytes()); // disk with CD
    zip.extend_from_slice(&count.to_le_bytes());
    zip.extend_from_slice(&count.to_le_bytes());
    zip.extend_from_slice(&cd_size.to_le_bytes());
    zip.extend_from_slice(&cd_offset.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes()); // comment length
    zip
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn open(files: &[(&str, &[u8], bool)]) -> StreamingZip<Cursor<Vec<u8>>> {
        StreamingZip::new(Cursor::new(build_test_zip(files))).unwrap()
    }

    fn add_zip_comment(mut zip: Vec<u8>, comment_len: usize) -> Vec<u8> {
        let eocd_pos = zip.len() - EOCD_MIN_SIZE;
        zip[eocd_pos + 20..eocd_pos + 22].copy_from_slice(&(comment_len as u16).to_le_bytes());
        zip.extend_from_slice(&vec![b'A'; comment_len]);
        zip
    }

    #[test]
    fn test_read_stored_entry() {
        let mut zip = open(&[("mimetype", b"application/epub+zip", false)]);
        assert_eq!(zip.num_entries(), 1);
        assert_eq!(zip.read_entry("mimetype").unwrap(), b"application/epub+zip");
    }

    #[test]
    fn test_read_deflated_entry() {
        let body = "<p>lorem ipsum dolor sit amet</p>".repeat(400);
        let mut zip = open(&[("OEBPS/ch1.xhtml", body.as_bytes(), true)]);
        let entry = zip.get_entry("OEBPS/ch1.xhtml").unwrap().clone();
        assert_eq!(entry.method, METHOD_DEFLATED);
        assert!(entry.compressed_size < entry.uncompressed_size);
        assert_eq!(zip.read_entry("OEBPS/ch1.xhtml").unwrap(), body.as_bytes());
    }

    #[test]
    fn test_get_entry_is_case_and_slash_insensitive() {
        let zip = open(&[("OEBPS/Text/Ch1.xhtml", b"x", false)]);
        assert!(zip.get_entry("/oebps/text/ch1.xhtml").is_some());
        assert!(zip.get_entry("OEBPS/Text/Ch2.xhtml").is_none());
    }

    #[test]
    fn test_missing_entry_is_file_not_found() {
        let mut zip = open(&[("mimetype", b"application/epub+zip", false)]);
        assert_eq!(zip.read_entry("nope.xhtml"), Err(ZipError::FileNotFound));
    }

    #[test]
    fn test_entry_sizes_report_uncompressed_length() {
        let body = "a".repeat(5000);
        let zip = open(&[
            ("mimetype", b"application/epub+zip", false),
            ("big.xhtml", body.as_bytes(), true),
        ]);
        let sizes = zip.entry_sizes();
        assert_eq!(sizes.get("mimetype"), Some(&20));
        assert_eq!(sizes.get("big.xhtml"), Some(&5000));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut data = build_test_zip(&[("a.txt", b"hello", false)]);
        // Corrupt the stored payload (30-byte header + 5-byte name).
        data[35] = b'j';
        let mut zip = StreamingZip::new(Cursor::new(data)).unwrap();
        assert_eq!(zip.read_entry("a.txt"), Err(ZipError::CrcMismatch));
    }

    #[test]
    fn test_huge_declared_size_does_not_drive_allocation() {
        let mut data = build_test_zip(&[("a.txt", b"hello", false)]);
        let eocd_pos = data.len() - EOCD_MIN_SIZE;
        let cd = read_u32_le(&data, eocd_pos + 16) as usize;
        // Central directory uncompressed size field.
        data[cd + 24..cd + 28].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());

        let mut zip = StreamingZip::new(Cursor::new(data)).unwrap();
        let entry = zip.get_entry("a.txt").unwrap().clone();
        assert_eq!(entry.uncompressed_size, 0xFFFF_FFFE);
        assert_eq!(prealloc_len(&entry), MAX_PREALLOC);
        assert_eq!(zip.read_entry("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_eocd_found_with_long_comment() {
        let data = add_zip_comment(
            build_test_zip(&[("mimetype", b"application/epub+zip", false)]),
            2_000,
        );
        let mut zip = StreamingZip::new(Cursor::new(data)).expect("EOCD should be discoverable");
        assert!(zip.validate_mimetype().is_ok());
    }

    #[test]
    fn test_not_a_zip_rejected() {
        let result = StreamingZip::new(Cursor::new(b"this is not a zip archive at all".to_vec()));
        assert!(matches!(result, Err(ZipError::InvalidFormat)));
    }

    #[test]
    fn test_zip64_sentinel_rejected() {
        let mut data = build_test_zip(&[("mimetype", b"application/epub+zip", false)]);
        let eocd_pos = data.len() - EOCD_MIN_SIZE;
        data[eocd_pos + 10..eocd_pos + 12].copy_from_slice(&u16::MAX.to_le_bytes());
        let result = StreamingZip::new(Cursor::new(data));
        assert!(matches!(result, Err(ZipError::UnsupportedZip64)));
    }

    #[test]
    fn test_validate_mimetype_wrong_content() {
        let mut zip = open(&[("mimetype", b"text/plain", false)]);
        match zip.validate_mimetype() {
            Err(ZipError::InvalidMimetype(msg)) => assert!(msg.contains("text/plain")),
            other => panic!("Expected InvalidMimetype, got {:?}", other),
        }
    }

    #[test]
    fn test_zip_limits_enforced_when_configured() {
        let data = build_test_zip(&[("data.txt", b"1234567890", false)]);
        let limits = ZipLimits::new(8, 8);
        let mut zip = StreamingZip::new_with_limits(Cursor::new(data), Some(limits)).unwrap();
        assert_eq!(zip.read_entry("data.txt"), Err(ZipError::FileTooLarge));
    }
}
