//! Tests for the file handle and the page manager
//!
//! These tests verify:
//! - Positional I/O and mapping of the data file
//! - Page allocation, release and reuse of the free page pool
//! - Persistence of the file header page
//! - Eviction and write-back of cached pages
//! - Trailing free pages being truncated on close

mod manager_tests;

use std::path::PathBuf;

use atlasblob::os::File;
use atlasblob::page::PageManager;
use atlasblob::Config;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

pub const PAGE_SIZE: usize = 1024;

pub fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pages.db");
    (temp_dir, path)
}

pub fn test_config(path: &PathBuf) -> Config {
    Config::builder()
        .data_path(path)
        .page_size(PAGE_SIZE)
        .build()
}

pub fn open_manager(path: &PathBuf, config: &Config) -> PageManager {
    let file = if path.exists() {
        File::open(path, config.read_only).unwrap()
    } else {
        File::create(path).unwrap()
    };
    PageManager::open(file, config).unwrap()
}
