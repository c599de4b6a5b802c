//! Tests for blobs spanning several pages

use atlasblob::blob::{BlobManager, PAGE_OVERHEAD};
use atlasblob::{AtlasError, BlobId, ReadBuffer, Record, RecordFlags};

use super::*;

fn read_all(manager: &DiskBlobManager, id: BlobId) -> Vec<u8> {
    let mut out = Vec::new();
    manager
        .read(id, RecordFlags::empty(), ReadBuffer::Arena(&mut out))
        .unwrap();
    out
}

fn first_page(id: BlobId) -> u64 {
    id.as_u64() - PAGE_OVERHEAD as u64
}

// =============================================================================
// Page Count Tests
// =============================================================================

#[test]
fn test_page_count_is_ceil_of_total() {
    let cases = [
        // (data size, expected pages); total = data + 28
        (USABLE as usize - 27, 2),
        (2 * USABLE as usize - 28, 2),
        (2 * USABLE as usize - 27, 3),
        (10 * USABLE as usize, 11),
    ];

    for (size, pages) in cases {
        let (_temp, mut manager) = setup_disk_manager();
        let id = manager.allocate(&Record::new(&payload(size, 1)), RecordFlags::empty()).unwrap();

        let info = manager.inspect_page(first_page(id)).unwrap();
        assert_eq!(info.num_pages, pages, "size {}", size);
        assert_eq!(info.free_bytes, 0);
        assert!(info.freelist.is_empty());

        // Header page + span
        assert_eq!(manager.page_manager().page_count(), 1 + pages as u64);
        for i in 1..pages as u64 {
            let info = manager.inspect_page(first_page(id) + i * PAGE_SIZE as u64).unwrap();
            assert_eq!(info.num_pages, 0);
        }
    }
}

#[test]
fn test_multi_page_round_trip() {
    let (_temp, mut manager) = setup_disk_manager();
    let data = payload(3 * USABLE as usize + 123, 5);

    let id = manager.allocate(&Record::new(&data), RecordFlags::empty()).unwrap();

    assert_eq!(id.as_u64() % PAGE_SIZE as u64, PAGE_OVERHEAD as u64);
    assert_eq!(manager.blob_size(id).unwrap(), data.len() as u64);
    assert_eq!(read_all(&manager, id), data);
    assert_eq!(
        manager.read_bytes(id, RecordFlags::DIRECT_ACCESS).unwrap(),
        &data[..]
    );
}

#[test]
fn test_partial_read_across_page_boundary() {
    let (_temp, mut manager) = setup_disk_manager();
    let data = payload(4000, 6);
    let id = manager.allocate(&Record::new(&data), RecordFlags::empty()).unwrap();

    // The first page holds data[..USABLE - 28]
    let start = USABLE - 28 - 10;
    let mut out = Vec::new();
    let n = manager
        .read_partial(id, start, 20, ReadBuffer::Arena(&mut out))
        .unwrap();

    assert_eq!(n, 20);
    assert_eq!(out, &data[start as usize..start as usize + 20]);
}

#[test]
fn test_continuation_page_id_is_invalid() {
    let (_temp, mut manager) = setup_disk_manager();
    let id = manager
        .allocate(&Record::new(&payload(3000, 1)), RecordFlags::empty())
        .unwrap();

    let continuation = BlobId::new(id.as_u64() + PAGE_SIZE as u64);
    assert!(matches!(
        manager.blob_size(continuation),
        Err(AtlasError::InvalidBlobId(_))
    ));

    // Inside the first page but not at the start of the usable area
    let misplaced = BlobId::new(id.as_u64() + 100);
    assert!(manager.blob_size(misplaced).is_err());
}

// =============================================================================
// Erase / Growth Tests
// =============================================================================

#[test]
fn test_erase_releases_every_page_of_the_span() {
    let (_temp, mut manager) = setup_disk_manager();
    let id = manager
        .allocate(&Record::new(&payload(3 * USABLE as usize, 1)), RecordFlags::empty())
        .unwrap();
    let pages = manager.inspect_page(first_page(id)).unwrap().num_pages as usize;

    manager.erase(id, RecordFlags::empty()).unwrap();

    let pm = manager.page_manager();
    assert_eq!(pm.free_page_count(), pages);
    assert!(pm.allocated_pages().is_empty());

    // A span of the same length reuses the freed run
    let again = manager
        .allocate(&Record::new(&payload(3 * USABLE as usize, 2)), RecordFlags::empty())
        .unwrap();
    assert_eq!(again, id);
    assert_eq!(manager.page_manager().free_page_count(), 0);
}

#[test]
fn test_growth_within_span_is_in_place() {
    let (_temp, mut manager) = setup_disk_manager();
    let id = manager
        .allocate(&Record::new(&payload(2000, 1)), RecordFlags::empty())
        .unwrap();

    // Two pages reserve 2 * USABLE bytes, header included
    let grown = payload(2 * USABLE as usize - 28, 2);
    let same = manager.overwrite(id, &Record::new(&grown), RecordFlags::empty()).unwrap();
    assert_eq!(same, id);
    assert_eq!(read_all(&manager, id), grown);

    let bigger = payload(2 * USABLE as usize, 3);
    let moved = manager.overwrite(id, &Record::new(&bigger), RecordFlags::empty()).unwrap();
    assert_ne!(moved, id);
    assert_eq!(read_all(&manager, moved), bigger);
}

#[test]
fn test_shrink_releases_trailing_pages() {
    let (_temp, mut manager) = setup_disk_manager();
    let id = manager
        .allocate(&Record::new(&payload(4 * USABLE as usize, 1)), RecordFlags::empty())
        .unwrap();
    assert_eq!(manager.inspect_page(first_page(id)).unwrap().num_pages, 5);

    let smaller = payload(2 * USABLE as usize, 2);
    let same = manager.overwrite(id, &Record::new(&smaller), RecordFlags::empty()).unwrap();

    assert_eq!(same, id);
    assert_eq!(manager.inspect_page(first_page(id)).unwrap().num_pages, 3);
    assert_eq!(manager.page_manager().free_page_count(), 2);
    assert_eq!(read_all(&manager, id), smaller);
}
