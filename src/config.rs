//! Configuration for AtlasBlob
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{AtlasError, Result};

/// Smallest supported page size (1 KiB)
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size (64 KiB)
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Main configuration for an AtlasBlob store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the single data file holding all pages
    pub data_path: PathBuf,

    /// Which blob manager backs the store
    pub backend: Backend,

    /// Size of every page in the data file (power of two)
    pub page_size: usize,

    /// Upper bound on the number of pages in the file (0 = unlimited)
    pub max_pages: u64,

    /// Open the file read-only (mutating operations fail)
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Page Cache Configuration
    // -------------------------------------------------------------------------
    /// Map the existing file read-only so direct-access reads avoid copies
    pub enable_mmap: bool,

    /// Number of clean pages kept in the cache before eviction kicks in
    pub cache_capacity: usize,
}

/// Blob manager backend, selected once when the store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Blobs live in pages of the data file
    Disk,

    /// Blobs live in process memory; nothing is persisted
    InMemory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./atlasblob.db"),
            backend: Backend::Disk,
            page_size: 16 * 1024, // 16 KiB
            max_pages: 0,
            read_only: false,
            enable_mmap: true,
            cache_capacity: 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that the on-disk layout depends on
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(AtlasError::Config(format!(
                "page size must be a power of two between {} and {}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }

        if self.cache_capacity == 0 {
            return Err(AtlasError::Config(
                "cache capacity must hold at least one page".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data file path
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_path = path.into();
        self
    }

    /// Set the blob manager backend
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the maximum number of pages (0 = unlimited)
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.config.max_pages = pages;
        self
    }

    /// Open the data file read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Enable or disable memory-mapped reads
    pub fn enable_mmap(mut self, enable: bool) -> Self {
        self.config.enable_mmap = enable;
        self
    }

    /// Set the page cache capacity (in pages)
    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.config.cache_capacity = pages;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
