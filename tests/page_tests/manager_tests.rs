//! Tests for PageManager

use atlasblob::page::{PageManager, PageType, PERSISTENT_HEADER_SIZE};
use atlasblob::{AtlasError, Config};

use super::*;

const P: u64 = PAGE_SIZE as u64;

fn stamp(manager: &PageManager, address: u64, byte: u8) {
    let page = manager.fetch_page(address, false).unwrap();
    page.write().payload_mut()[0] = byte;
}

fn first_payload_byte(manager: &PageManager, address: u64) -> u8 {
    let page = manager.fetch_page(address, true).unwrap();
    let page = page.read();
    page.payload()[0]
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_new_file_writes_header() {
    let (_temp, path) = setup_temp_file();
    let manager = open_manager(&path, &test_config(&path));

    assert_eq!(manager.page_count(), 1);
    assert_eq!(manager.page_size(), PAGE_SIZE);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), P);
    assert!(!manager.is_mapped());
}

#[test]
fn test_stored_page_size_wins() {
    let (_temp, path) = setup_temp_file();
    open_manager(&path, &test_config(&path)).close().unwrap();

    let config = Config::builder().data_path(&path).page_size(4096).build();
    let manager = open_manager(&path, &config);
    assert_eq!(manager.page_size(), PAGE_SIZE);
}

#[test]
fn test_corrupted_header_detected() {
    let (_temp, path) = setup_temp_file();
    open_manager(&path, &test_config(&path)).close().unwrap();

    // Flip a byte inside the encoded header body
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[PERSISTENT_HEADER_SIZE + 8] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let file = File::open(&path, false).unwrap();
    let result = PageManager::open(file, &test_config(&path));
    assert!(matches!(result, Err(AtlasError::Corruption(_))));
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_alloc_release_reuse() {
    let (_temp, path) = setup_temp_file();
    let manager = open_manager(&path, &test_config(&path));

    let a = manager.alloc_page(PageType::Blob).unwrap().read().address();
    let b = manager.alloc_page(PageType::Blob).unwrap().read().address();
    assert_eq!((a, b), (P, 2 * P));

    manager.release_page(a).unwrap();
    assert!(!manager.is_allocated(a));
    assert_eq!(manager.allocated_pages(), vec![b]);

    let c = manager.alloc_page(PageType::Blob).unwrap().read().address();
    assert_eq!(c, a);
    assert_eq!(manager.page_count(), 3);
}

#[test]
fn test_alloc_contiguous_prefers_free_run() {
    let (_temp, path) = setup_temp_file();
    let manager = open_manager(&path, &test_config(&path));

    let pages = manager.alloc_contiguous(4, PageType::Blob).unwrap();
    let addresses: Vec<u64> = pages.iter().map(|p| p.read().address()).collect();
    assert_eq!(addresses, vec![P, 2 * P, 3 * P, 4 * P]);
    drop(pages);

    // Free pages 1 and 3..4: only 3..4 is a run of two
    manager.release_page(P).unwrap();
    manager.release_page(3 * P).unwrap();
    manager.release_page(4 * P).unwrap();

    let run = manager.alloc_contiguous(2, PageType::Blob).unwrap();
    assert_eq!(run[0].read().address(), 3 * P);
    assert_eq!(run[1].read().address(), 4 * P);

    // No run of three left: append
    let appended = manager.alloc_contiguous(3, PageType::Blob).unwrap();
    assert_eq!(appended[0].read().address(), 5 * P);
    assert_eq!(manager.page_count(), 8);
}

#[test]
fn test_fetch_rejects_free_and_header_pages() {
    let (_temp, path) = setup_temp_file();
    let manager = open_manager(&path, &test_config(&path));
    let a = manager.alloc_page(PageType::Blob).unwrap().read().address();
    manager.release_page(a).unwrap();

    assert!(manager.fetch_page(0, true).is_err());
    assert!(manager.fetch_page(a, true).is_err());
    assert!(manager.fetch_page(a + 1, true).is_err());
    assert!(manager.fetch_page(100 * P, true).is_err());
    assert!(manager.release_page(a).is_err());
}

#[test]
fn test_max_pages_limit() {
    let (_temp, path) = setup_temp_file();
    let config = Config::builder()
        .data_path(&path)
        .page_size(PAGE_SIZE)
        .max_pages(3)
        .build();
    let manager = open_manager(&path, &config);

    manager.alloc_page(PageType::Blob).unwrap();
    assert!(matches!(
        manager.alloc_contiguous(2, PageType::Blob),
        Err(AtlasError::OutOfSpace(_))
    ));
    manager.alloc_page(PageType::Blob).unwrap();
    assert!(matches!(
        manager.alloc_page(PageType::Blob),
        Err(AtlasError::OutOfSpace(_))
    ));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_state_survives_reopen() {
    let (_temp, path) = setup_temp_file();
    let config = test_config(&path);

    {
        let manager = open_manager(&path, &config);
        for _ in 0..3 {
            manager.alloc_page(PageType::Blob).unwrap();
        }
        stamp(&manager, 2 * P, 0x42);
        manager.release_page(P).unwrap();
        manager.set_last_blob_page(Some(2 * P));
        manager.flush().unwrap();
    }

    let manager = open_manager(&path, &config);
    assert_eq!(manager.page_count(), 4);
    assert_eq!(manager.free_page_count(), 1);
    assert!(!manager.is_allocated(P));
    assert_eq!(manager.last_blob_page(), Some(2 * P));
    assert_eq!(first_payload_byte(&manager, 2 * P), 0x42);
}

#[test]
fn test_close_truncates_trailing_free_pages() {
    let (_temp, path) = setup_temp_file();
    let config = test_config(&path);

    let manager = open_manager(&path, &config);
    for _ in 0..4 {
        manager.alloc_page(PageType::Blob).unwrap();
    }
    manager.release_page(3 * P).unwrap();
    manager.release_page(4 * P).unwrap();
    manager.release_page(P).unwrap();
    manager.close().unwrap();
    drop(manager);

    // Page 1 is not trailing and stays in the pool
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * P);
    let manager = open_manager(&path, &config);
    assert_eq!(manager.page_count(), 3);
    assert_eq!(manager.free_page_count(), 1);
}

#[test]
fn test_fragmented_free_pool_survives_flush_and_reopen() {
    let (_temp, path) = setup_temp_file();
    let config = test_config(&path);

    {
        let manager = open_manager(&path, &config);
        manager.alloc_contiguous(400, PageType::Blob).unwrap();

        // Every other page: 200 single-page runs, far more than page 0 holds
        for i in (1..=400u64).step_by(2) {
            manager.release_page(i * P).unwrap();
        }
        assert_eq!(manager.free_page_count(), 200);

        manager.flush().unwrap();
        assert_eq!(manager.free_page_count(), 200);
        assert_eq!(manager.allocated_pages().len(), 200);
    }

    let manager = open_manager(&path, &config);
    assert_eq!(manager.page_count(), 401);
    assert_eq!(manager.free_page_count(), 200);
    assert!(!manager.is_allocated(P));
    assert!(manager.is_allocated(2 * P));

    let reused = manager.alloc_page(PageType::Blob).unwrap().read().address();
    assert_eq!(reused, P);
    assert_eq!(manager.page_count(), 401);
}

#[test]
fn test_long_free_run_survives_reopen() {
    let (_temp, path) = setup_temp_file();
    let config = test_config(&path);

    {
        let manager = open_manager(&path, &config);
        manager.alloc_contiguous(301, PageType::Blob).unwrap();
        for i in 1..=300u64 {
            manager.release_page(i * P).unwrap();
        }
        manager.flush().unwrap();
    }

    let manager = open_manager(&path, &config);
    assert_eq!(manager.free_page_count(), 300);
    assert_eq!(manager.allocated_pages(), vec![301 * P]);

    let run = manager.alloc_contiguous(300, PageType::Blob).unwrap();
    assert_eq!(run[0].read().address(), P);
    assert_eq!(manager.page_count(), 302);
}

// =============================================================================
// Cache Tests
// =============================================================================

#[test]
fn test_eviction_writes_back_dirty_pages() {
    let (_temp, path) = setup_temp_file();
    let config = Config::builder()
        .data_path(&path)
        .page_size(PAGE_SIZE)
        .cache_capacity(2)
        .build();
    let manager = open_manager(&path, &config);

    for i in 1..=6u64 {
        manager.alloc_page(PageType::Blob).unwrap();
        stamp(&manager, i * P, i as u8);
    }
    assert!(manager.cached_page_count() <= 3);

    for i in 1..=6u64 {
        assert_eq!(first_payload_byte(&manager, i * P), i as u8);
    }
}

#[test]
fn test_mapped_pages_detach_on_write() {
    let (_temp, path) = setup_temp_file();
    let config = Config::builder()
        .data_path(&path)
        .page_size(PAGE_SIZE)
        .cache_capacity(1)
        .build();

    {
        let manager = open_manager(&path, &config);
        manager.alloc_page(PageType::Blob).unwrap();
        manager.alloc_page(PageType::Blob).unwrap();
        stamp(&manager, P, 1);
        manager.close().unwrap();
    }

    let manager = open_manager(&path, &config);
    assert!(manager.is_mapped());
    assert!(manager.fetch_page(P, true).unwrap().read().is_mapped());

    stamp(&manager, P, 9);
    manager.flush().unwrap();

    // Push page 1 out of the cache, then load it again
    manager.fetch_page(2 * P, true).unwrap();
    assert_eq!(first_payload_byte(&manager, P), 9);
}

#[test]
fn test_read_only_manager() {
    let (_temp, path) = setup_temp_file();
    {
        let manager = open_manager(&path, &test_config(&path));
        manager.alloc_page(PageType::Blob).unwrap();
        manager.close().unwrap();
    }

    let config = Config::builder()
        .data_path(&path)
        .page_size(PAGE_SIZE)
        .read_only(true)
        .build();
    let manager = open_manager(&path, &config);

    assert!(manager.is_read_only());
    assert!(manager.fetch_page(P, true).is_ok());
    assert!(matches!(manager.fetch_page(P, false), Err(AtlasError::Config(_))));
    assert!(manager.alloc_page(PageType::Blob).is_err());
    assert!(manager.release_page(P).is_err());
}
