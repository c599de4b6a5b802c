//! Tests for BlobStore
//!
//! These tests verify:
//! - Opening disk and in-memory stores from a Config
//! - Put/get/replace/remove through the facade
//! - The page-level integrity check
//! - Statistics and close/reopen

use std::path::PathBuf;

use atlasblob::blob::{BlobPageHeaderMut, PAGE_OVERHEAD};
use atlasblob::page::PERSISTENT_HEADER_SIZE;
use atlasblob::{AtlasError, Backend, BlobStore, Config, ReadBuffer, Record, RecordFlags};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const PAGE_SIZE: usize = 4096;

fn setup_temp_store() -> (TempDir, PathBuf, BlobStore) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.db");
    let store = BlobStore::open(disk_config(&path)).unwrap();
    (temp_dir, path, store)
}

fn disk_config(path: &PathBuf) -> Config {
    Config::builder()
        .data_path(path)
        .page_size(PAGE_SIZE)
        .build()
}

// =============================================================================
// Basic Operation Tests
// =============================================================================

#[test]
fn test_put_get_replace_remove() {
    let (_temp, _path, mut store) = setup_temp_store();

    let id = store.put(b"first value").unwrap();
    assert_eq!(store.get(id).unwrap(), b"first value");
    assert_eq!(store.size(id).unwrap(), 11);

    let id = store.replace(id, b"short").unwrap();
    assert_eq!(store.get(id).unwrap(), b"short");

    let big = vec![0x33u8; 10_000];
    let moved = store.replace(id, &big).unwrap();
    assert_ne!(moved, id);
    assert_eq!(store.get_bytes(moved).unwrap(), &big[..]);

    store.remove(moved).unwrap();
    assert!(matches!(store.get(moved), Err(AtlasError::InvalidBlobId(_))));
}

#[test]
fn test_manager_access_with_flags() {
    let (_temp, _path, mut store) = setup_temp_store();

    let id = store
        .manager_mut()
        .allocate(&Record::partial(b"xy", 3, 6), RecordFlags::PARTIAL)
        .unwrap();

    let mut buf = [0u8; 6];
    let n = store
        .manager()
        .read(id, RecordFlags::USER_ALLOC, ReadBuffer::User(&mut buf))
        .unwrap();
    assert_eq!(n, 6);
    assert_eq!(&buf, &[0, 0, 0, b'x', b'y', 0]);
}

#[test]
fn test_in_memory_backend() {
    let config = Config::builder().backend(Backend::InMemory).build();
    let mut store = BlobStore::open(config).unwrap();

    let id = store.put(b"volatile").unwrap();
    assert_eq!(id.as_u64(), 1);
    assert_eq!(store.get(id).unwrap(), b"volatile");
    assert!(store.page_manager().is_none());
    assert!(store.check().unwrap().is_ok());
    assert_eq!(store.stats().page_count, 0);
    store.close().unwrap();
}

#[test]
fn test_read_only_store_requires_existing_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("missing.db");
    let config = Config::builder().data_path(&path).read_only(true).build();

    assert!(matches!(BlobStore::open(config), Err(AtlasError::Config(_))));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_after_close() {
    let (_temp, path, mut store) = setup_temp_store();
    let small = store.put(b"small").unwrap();
    let large = store.put(&vec![0x44u8; 20_000]).unwrap();
    store.close().unwrap();

    let store = BlobStore::open(disk_config(&path)).unwrap();
    assert_eq!(store.get(small).unwrap(), b"small");
    assert_eq!(store.get(large).unwrap(), vec![0x44u8; 20_000]);
    assert!(store.stats().mapped);
}

#[test]
fn test_close_reclaims_released_tail() {
    let (_temp, path, mut store) = setup_temp_store();
    let keep = store.put(b"keep").unwrap();
    let large = store.put(&vec![1u8; 3 * PAGE_SIZE]).unwrap();
    store.remove(large).unwrap();
    store.close().unwrap();

    // Header page + the page holding `keep`
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * PAGE_SIZE as u64);

    let store = BlobStore::open(disk_config(&path)).unwrap();
    assert_eq!(store.get(keep).unwrap(), b"keep");
}

// =============================================================================
// Check / Stats Tests
// =============================================================================

#[test]
fn test_check_reports_consistent_file() {
    let (_temp, _path, mut store) = setup_temp_store();
    store.put(&[1u8; 100]).unwrap();
    store.put(&[2u8; 3 * PAGE_SIZE]).unwrap();

    let report = store.check().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
    assert_eq!(report.blob_pages, 2);
    assert_eq!(report.continuation_pages, 3);
    assert_eq!(
        report.free_bytes,
        (PAGE_SIZE - PAGE_OVERHEAD - 128) as u64
    );

    let stats = store.stats();
    assert_eq!(stats.backend, Backend::Disk);
    assert_eq!(stats.page_size, PAGE_SIZE);
    assert_eq!(stats.page_count, 6);
    assert_eq!(stats.free_pages, 0);
}

#[test]
fn test_check_detects_corrupted_free_list() {
    let (_temp, path, mut store) = setup_temp_store();
    let id = store.put(&[5u8; 100]).unwrap();
    store.close().unwrap();

    // Break the free_bytes counter of the first blob page
    let mut bytes = std::fs::read(&path).unwrap();
    let header_start = PAGE_SIZE + PERSISTENT_HEADER_SIZE;
    {
        let mut header = BlobPageHeaderMut::new(&mut bytes[header_start..header_start + 264]);
        let free = header.free_bytes();
        header.set_free_bytes(free + 1);
    }
    std::fs::write(&path, &bytes).unwrap();

    let store = BlobStore::open(disk_config(&path)).unwrap();
    let report = store.check().unwrap();
    assert_eq!(report.problems.len(), 1);
    assert_eq!(report.problems[0].0, PAGE_SIZE as u64);
    assert!(matches!(store.get(id), Err(AtlasError::Corruption(_))));
}

#[test]
fn test_large_free_pool_keeps_check_clean() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("small_pages.db");
    let config = || Config::builder().data_path(&path).page_size(1024).build();

    let mut store = BlobStore::open(config()).unwrap();
    let small = store.put(b"keep").unwrap();
    let large = store.put(&vec![7u8; 300 * 744]).unwrap();
    store.remove(large).unwrap();

    let free_before = store.stats().free_pages;
    assert!(free_before >= 300);
    store.flush().unwrap();
    assert_eq!(store.stats().free_pages, free_before);
    assert!(store.check().unwrap().is_ok());
    drop(store);

    let store = BlobStore::open(config()).unwrap();
    assert_eq!(store.stats().free_pages, free_before);
    assert_eq!(store.get(small).unwrap(), b"keep");
    let report = store.check().unwrap();
    assert!(report.is_ok(), "{:?}", report.problems);
}
