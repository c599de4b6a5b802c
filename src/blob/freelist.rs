//! Per-page free-list operations
//!
//! Offsets are relative to the page's usable area. Allocation is best-fit
//! (smallest entry that is large enough, lowest offset on ties). Returned
//! ranges are merged with adjacent entries.
//!
//! The list has a fixed number of slots. When a range cannot be merged and
//! every slot is taken, the smallest entry is evicted if the new range is
//! larger; otherwise the new range is dropped. Either way the lost bytes are
//! leaked until the page is rewritten.

use super::header::{BlobPageHeader, FreelistEntry};

/// Outcome of returning a range to the free-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreelistInsert {
    /// Stored (possibly merged with neighbours)
    Inserted,

    /// Stored in place of a smaller entry, which is now leaked
    Evicted { offset: u32, size: u32 },

    /// Not stored; the range is leaked
    Dropped,
}

impl FreelistInsert {
    /// Bytes that are no longer tracked by the free-list
    pub fn leaked(&self, size: u32) -> u32 {
        match self {
            FreelistInsert::Inserted => 0,
            FreelistInsert::Evicted { size: lost, .. } => *lost,
            FreelistInsert::Dropped => size,
        }
    }
}

/// Take `size` bytes out of the free-list
///
/// Returns the offset of the range, or `None` if no entry is large enough.
pub(crate) fn alloc_from_freelist<B>(header: &mut BlobPageHeader<B>, size: u32) -> Option<u32>
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    if size == 0 {
        return None;
    }

    let mut best: Option<(usize, FreelistEntry)> = None;
    for i in 0..header.freelist_entries() {
        let entry = FreelistEntry {
            offset: header.freelist_offset(i),
            size: header.freelist_size(i),
        };
        if entry.size < size {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, b)) => {
                entry.size < b.size || (entry.size == b.size && entry.offset < b.offset)
            }
        };
        if better {
            best = Some((i, entry));
        }
    }

    let (slot, entry) = best?;
    if entry.size == size {
        header.clear_slot(slot);
    } else {
        header.set_freelist_offset(slot, entry.offset + size);
        header.set_freelist_size(slot, entry.size - size);
    }
    header.set_free_bytes(header.free_bytes() - size);

    Some(entry.offset)
}

/// Return `[offset, offset + size)` to the free-list
pub(crate) fn add_to_freelist<B>(
    header: &mut BlobPageHeader<B>,
    offset: u32,
    size: u32,
) -> FreelistInsert
where
    B: AsRef<[u8]> + AsMut<[u8]>,
{
    if size == 0 {
        return FreelistInsert::Inserted;
    }

    let mut start = offset;
    let mut end = offset + size;
    let mut free_slot = None;

    for i in 0..header.freelist_entries() {
        let entry_size = header.freelist_size(i);
        if entry_size == 0 {
            free_slot.get_or_insert(i);
            continue;
        }
        let entry_offset = header.freelist_offset(i);
        if entry_offset + entry_size == start {
            start = entry_offset;
            header.clear_slot(i);
            free_slot.get_or_insert(i);
        } else if entry_offset == end {
            end = entry_offset + entry_size;
            header.clear_slot(i);
            free_slot.get_or_insert(i);
        }
    }

    let merged = end - start;

    if let Some(slot) = free_slot {
        header.set_freelist_offset(slot, start);
        header.set_freelist_size(slot, merged);
        header.set_free_bytes(header.free_bytes() + size);
        return FreelistInsert::Inserted;
    }

    // Every slot is taken and nothing was merged, so `merged == size`
    let smallest = (0..header.freelist_entries())
        .min_by_key(|&i| (header.freelist_size(i), header.freelist_offset(i)))
        .map(|i| (i, header.freelist_offset(i), header.freelist_size(i)));

    match smallest {
        Some((slot, evicted_offset, evicted_size)) if evicted_size < size => {
            header.set_freelist_offset(slot, start);
            header.set_freelist_size(slot, size);
            header.set_free_bytes(header.free_bytes() + size - evicted_size);
            FreelistInsert::Evicted {
                offset: evicted_offset,
                size: evicted_size,
            }
        }
        _ => FreelistInsert::Dropped,
    }
}
