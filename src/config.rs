//! Reader configuration

use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_CHUNK_CACHE_CAPACITY, DEFAULT_PAGE_CACHE_CAPACITY};
use crate::chunk::DEFAULT_MAX_CHUNK_BYTES;
use crate::layout::PaginationConfig;
use crate::zip::ZipLimits;

/// Tunables for a reader session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Upper bound on a planned chunk's combined chapter size
    pub max_chunk_bytes: u64,
    /// Decoded chunks kept in memory (minimum 1)
    pub chunk_cache_capacity: usize,
    /// Paginated chapters kept in memory (minimum 1)
    pub page_cache_capacity: usize,
    /// Persist the position after every committed navigation
    pub autosave: bool,
    /// Viewport and font metrics
    pub pagination: PaginationConfig,
    /// ZIP read limits; `None` reads entries of any size
    pub zip_limits: Option<ZipLimits>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
            page_cache_capacity: DEFAULT_PAGE_CACHE_CAPACITY,
            autosave: true,
            pagination: PaginationConfig::default(),
            zip_limits: None,
        }
    }
}

impl ReaderConfig {
    /// Set the chunk size bound.
    pub fn with_max_chunk_bytes(mut self, bytes: u64) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Set the decoded chunk cache capacity.
    pub fn with_chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.chunk_cache_capacity = capacity.max(1);
        self
    }

    /// Set the paginated chapter cache capacity.
    pub fn with_page_cache_capacity(mut self, capacity: usize) -> Self {
        self.page_cache_capacity = capacity.max(1);
        self
    }

    /// Enable or disable saving the position after each navigation.
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    /// Set the pagination configuration.
    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    /// Set ZIP read limits.
    pub fn with_zip_limits(mut self, limits: ZipLimits) -> Self {
        self.zip_limits = Some(limits);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.max_chunk_bytes, 100 * 1024);
        assert_eq!(config.chunk_cache_capacity, 5);
        assert!(config.autosave);
        assert!(config.zip_limits.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ReaderConfig = serde_json::from_str(
            r#"{"chunk_cache_capacity": 2, "pagination": {"font_size": 20.0}}"#,
        )
        .unwrap();
        assert_eq!(config.chunk_cache_capacity, 2);
        assert_eq!(config.pagination.font_size, 20.0);
        assert_eq!(config.pagination.line_height, 24.0);
        assert_eq!(config.page_cache_capacity, 64);
    }

    #[test]
    fn test_builders_enforce_minimum_capacity() {
        let config = ReaderConfig::default()
            .with_chunk_cache_capacity(0)
            .with_page_cache_capacity(0);
        assert_eq!(config.chunk_cache_capacity, 1);
        assert_eq!(config.page_cache_capacity, 1);
    }
}
