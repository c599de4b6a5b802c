//! Disk Blob Manager
//!
//! Stores blobs inside pages of the data file.
//!
//! ## Responsibilities
//! - Small blobs: carve space from a page's free-list, preferring the
//!   page manager's last blob page
//! - Large blobs: span `ceil(total / usable)` contiguous pages
//! - Validate blob ids against the page layout and the blob header
//! - Overwrite in place when the allocation is large enough, otherwise
//!   allocate-then-erase
//! - Return space on erase and release pages that become empty
//!
//! Page header changes are made on a staged copy and stored back only after
//! the blob bytes were written and the free-list passed its integrity check.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{AtlasError, Result};
use crate::page::{PageManager, PageRef, PageType};

use super::chunk::{read_chunk, read_direct, stream_advance, write_chunks};
use super::freelist::{add_to_freelist, alloc_from_freelist, FreelistInsert};
use super::header::{BlobHeader, BlobPageHeaderMut, BlobPageHeaderRef, FreelistEntry};
use super::{
    usable_size, BlobId, BlobManager, ReadBuffer, Record, RecordFlags, BLOB_HEADER_SIZE,
    BLOB_PAGE_HEADER_SIZE, MIN_FREE_CHUNK, PAGE_OVERHEAD,
};

/// Snapshot of one blob page's header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPageInfo {
    pub address: u64,
    pub num_pages: u32,
    pub free_bytes: u32,
    pub freelist: Vec<FreelistEntry>,
}

/// A validated blob id
#[derive(Debug, Clone, Copy)]
struct ResolvedBlob {
    id: u64,
    page_address: u64,
    /// Offset of the blob header inside the usable area
    offset: u32,
    num_pages: u32,
    header: BlobHeader,
}

impl ResolvedBlob {
    fn data_start(&self) -> u64 {
        self.id + BLOB_HEADER_SIZE as u64
    }
}

/// Page-backed `BlobManager`
pub struct DiskBlobManager {
    page_manager: Arc<PageManager>,
    page_size: usize,
    usable: u32,
}

impl DiskBlobManager {
    pub fn new(page_manager: Arc<PageManager>) -> Self {
        let page_size = page_manager.page_size();
        Self {
            page_manager,
            page_size,
            usable: usable_size(page_size) as u32,
        }
    }

    /// The page manager this blob manager allocates from
    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }

    /// Bytes available for blobs in one page
    pub fn usable_size(&self) -> u32 {
        self.usable
    }

    /// Read the header of the blob page at `address`
    ///
    /// Fails with `Corruption` if the page is not a blob page or its
    /// free-list is inconsistent.
    pub fn inspect_page(&self, address: u64) -> Result<BlobPageInfo> {
        let page = self.page_manager.fetch_page(address, true)?;
        let page = page.read();

        if page.page_type() != Some(PageType::Blob) {
            return Err(AtlasError::Corruption(format!(
                "page {:#x} is not a blob page (type {})",
                address,
                page.page_type_raw()
            )));
        }

        let header = BlobPageHeaderRef::new(&page.payload()[..BLOB_PAGE_HEADER_SIZE]);
        header.check_integrity(self.usable)?;

        Ok(BlobPageInfo {
            address,
            num_pages: header.num_pages(),
            free_bytes: header.free_bytes(),
            freelist: header.entries(),
        })
    }

    // =========================================================================
    // Blob Id Validation
    // =========================================================================

    fn resolve(&self, blob_id: BlobId) -> Result<ResolvedBlob> {
        let id = blob_id.as_u64();
        let invalid = || AtlasError::InvalidBlobId(id);

        let page_size = self.page_size as u64;
        let page_address = id - id % page_size;
        let in_page = (id % page_size) as usize;

        if in_page < PAGE_OVERHEAD || in_page + BLOB_HEADER_SIZE > self.page_size {
            return Err(invalid());
        }
        if !self.page_manager.is_allocated(page_address) {
            return Err(invalid());
        }

        let (num_pages, header) = {
            let page = self.page_manager.fetch_page(page_address, true)?;
            let page = page.read();

            if page.page_type() != Some(PageType::Blob) {
                return Err(invalid());
            }

            let page_header = BlobPageHeaderRef::new(&page.payload()[..BLOB_PAGE_HEADER_SIZE]);
            let num_pages = page_header.num_pages();
            if num_pages == 0 || (num_pages > 1 && in_page != PAGE_OVERHEAD) {
                return Err(invalid());
            }
            page_header.check_integrity(self.usable)?;

            let header = BlobHeader::decode(&page.raw()[in_page..in_page + BLOB_HEADER_SIZE])
                .ok_or_else(invalid)?;
            (num_pages, header)
        };

        if header.blob_id != id {
            return Err(invalid());
        }

        let offset = (in_page - PAGE_OVERHEAD) as u64;
        let span = num_pages as u64 * self.usable as u64;
        let covers_size = (BLOB_HEADER_SIZE as u64)
            .checked_add(header.size)
            .map_or(false, |needed| header.allocated_size >= needed);
        let within_span = offset
            .checked_add(header.allocated_size)
            .map_or(false, |end| end <= span);
        if !covers_size || !within_span {
            return Err(invalid());
        }

        if (1..num_pages as u64).any(|i| !self.page_manager.is_allocated(page_address + i * page_size)) {
            return Err(invalid());
        }

        Ok(ResolvedBlob {
            id,
            page_address,
            offset: offset as u32,
            num_pages,
            header,
        })
    }

    // =========================================================================
    // Staged Page Headers
    // =========================================================================

    fn stage_header(page: &PageRef) -> Vec<u8> {
        page.read().payload()[..BLOB_PAGE_HEADER_SIZE].to_vec()
    }

    /// Check and store a staged page header
    fn commit_header(&self, page: &PageRef, staged: &[u8]) -> Result<()> {
        BlobPageHeaderRef::new(staged).check_integrity(self.usable)?;
        page.write().payload_mut()[..BLOB_PAGE_HEADER_SIZE].copy_from_slice(staged);
        Ok(())
    }

    fn report_leak(&self, page_address: u64, size: u32, outcome: FreelistInsert) {
        match outcome {
            FreelistInsert::Inserted => {}
            FreelistInsert::Evicted { offset, size: lost } => warn!(
                page = page_address,
                offset,
                leaked = lost,
                "free-list full, evicted smallest entry"
            ),
            FreelistInsert::Dropped => warn!(
                page = page_address,
                leaked = size,
                "free-list full, dropped freed range"
            ),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Find room for `size` bytes in a single page
    ///
    /// Returns the pinned page, its staged header (already charged), the
    /// offset inside the usable area and whether the page is new.
    fn reserve_in_page(&self, size: u32) -> Result<(PageRef, Vec<u8>, u32, bool)> {
        if let Some(hint) = self.page_manager.last_blob_page() {
            if self.page_manager.is_allocated(hint) {
                let page = self.page_manager.fetch_page(hint, false)?;
                if page.read().page_type() == Some(PageType::Blob) {
                    let mut staged = Self::stage_header(&page);
                    let mut header = BlobPageHeaderMut::new(staged.as_mut_slice());
                    if header.num_pages() == 1 {
                        if let Some(offset) = alloc_from_freelist(&mut header, size) {
                            return Ok((page, staged, offset, false));
                        }
                    }
                }
            }
        }

        let page = self.page_manager.alloc_page(PageType::Blob)?;
        let address = page.read().address();

        let mut staged = vec![0u8; BLOB_PAGE_HEADER_SIZE];
        let mut header = BlobPageHeaderMut::new(staged.as_mut_slice());
        header.initialize();
        header.set_num_pages(1);
        header.set_freelist_offset(0, 0);
        header.set_freelist_size(0, self.usable);
        header.set_free_bytes(self.usable);

        let Some(offset) = alloc_from_freelist(&mut header, size) else {
            drop(page);
            self.discard_pages(&[address]);
            return Err(AtlasError::Corruption(format!(
                "fresh page {:#x} cannot hold {} bytes",
                address, size
            )));
        };

        Ok((page, staged, offset, true))
    }

    /// Give back pages of an allocation that failed before its header was
    /// committed
    fn discard_pages(&self, addresses: &[u64]) {
        for &address in addresses {
            if let Err(e) = self.page_manager.release_page(address) {
                warn!(page = address, error = %e, "failed to release page of a failed allocation");
            }
        }
    }

    /// Bytes a blob of `size` bytes occupies, header included
    fn footprint(&self, size: u64) -> Result<u64> {
        (BLOB_HEADER_SIZE as u64)
            .checked_add(size)
            .filter(|&total| total / (self.usable as u64) < u32::MAX as u64)
            .ok_or_else(|| {
                AtlasError::OutOfSpace(format!("blob of {} bytes exceeds the page span limit", size))
            })
    }

    /// Allocate `count` contiguous pages for one blob
    fn reserve_span(&self, count: u64) -> Result<(Vec<PageRef>, Vec<u8>)> {
        let pages = self.page_manager.alloc_contiguous(count as usize, PageType::Blob)?;

        let mut staged = vec![0u8; BLOB_PAGE_HEADER_SIZE];
        let mut header = BlobPageHeaderMut::new(staged.as_mut_slice());
        header.initialize();
        header.set_num_pages(count as u32);

        Ok((pages, staged))
    }

    /// Write a blob header followed by the record bytes
    ///
    /// A partial record is placed at its offset; the rest is zero-filled.
    fn write_blob(
        &self,
        page: &PageRef,
        header: &BlobHeader,
        record: &Record<'_>,
        window_offset: u64,
    ) -> Result<()> {
        let lead = vec![0u8; window_offset as usize];
        let tail_len = header.size - window_offset - record.data.len() as u64;
        let tail = vec![0u8; tail_len as usize];

        write_chunks(
            &self.page_manager,
            Some(page),
            header.blob_id,
            &[&header.encode()[..], &lead[..], record.data, &tail[..]],
        )
    }

    fn pages_for(&self, total: u64) -> u64 {
        let usable = self.usable as u64;
        (total + usable - 1) / usable
    }

    /// Replace `old` with a freshly allocated blob
    fn relocate(
        &mut self,
        old: &ResolvedBlob,
        record: &Record<'_>,
        flags: RecordFlags,
    ) -> Result<BlobId> {
        let new_id = if flags.contains(RecordFlags::PARTIAL) {
            let (window_offset, size) = record.window(flags)?;
            let mut merged = vec![0u8; size as usize];
            let keep = old.header.size.min(size) as usize;
            read_chunk(&self.page_manager, None, old.data_start(), &mut merged[..keep], true)?;

            let start = window_offset as usize;
            merged[start..start + record.data.len()].copy_from_slice(record.data);
            self.allocate(&Record::new(&merged), flags.difference(RecordFlags::PARTIAL))?
        } else {
            self.allocate(record, flags)?
        };

        self.erase(BlobId::new(old.id), flags)?;

        debug!(old = old.id, new = new_id.as_u64(), "relocated blob");
        Ok(new_id)
    }
}

impl BlobManager for DiskBlobManager {
    fn allocate(&mut self, record: &Record<'_>, flags: RecordFlags) -> Result<BlobId> {
        let (window_offset, size) = record.window(flags)?;
        let total = self.footprint(size)?;

        if total <= self.usable as u64 {
            let (page, staged, offset, fresh) = self.reserve_in_page(total as u32)?;
            let page_address = page.read().address();
            let id = page_address + PAGE_OVERHEAD as u64 + offset as u64;

            let header = BlobHeader {
                blob_id: id,
                allocated_size: total,
                size,
                flags: 0,
            };
            let stored = self
                .write_blob(&page, &header, record, window_offset)
                .and_then(|()| self.commit_header(&page, &staged));
            drop(page);
            if let Err(e) = stored {
                if fresh {
                    self.discard_pages(&[page_address]);
                }
                return Err(e);
            }
            if fresh {
                self.page_manager.set_last_blob_page(Some(page_address));
            }

            debug!(blob_id = id, size, page = page_address, "allocated blob");
            return Ok(BlobId::new(id));
        }

        let count = self.pages_for(total);
        let (pages, staged) = self.reserve_span(count)?;
        let first = &pages[0];
        let page_address = first.read().address();
        let id = page_address + PAGE_OVERHEAD as u64;

        let header = BlobHeader {
            blob_id: id,
            allocated_size: count * self.usable as u64,
            size,
            flags: 0,
        };
        let stored = self
            .write_blob(first, &header, record, window_offset)
            .and_then(|()| self.commit_header(first, &staged));
        if let Err(e) = stored {
            let addresses: Vec<u64> = pages.iter().map(|p| p.read().address()).collect();
            drop(pages);
            self.discard_pages(&addresses);
            return Err(e);
        }

        debug!(blob_id = id, size, pages = count, "allocated multi-page blob");
        Ok(BlobId::new(id))
    }

    fn read(&self, blob_id: BlobId, flags: RecordFlags, buffer: ReadBuffer<'_>) -> Result<usize> {
        let blob = self.resolve(blob_id)?;
        let out = buffer.prepare(flags, blob.header.size)?;
        read_chunk(&self.page_manager, None, blob.data_start(), out, true)?;
        Ok(out.len())
    }

    fn read_partial(
        &self,
        blob_id: BlobId,
        offset: u64,
        size: u64,
        buffer: ReadBuffer<'_>,
    ) -> Result<usize> {
        let blob = self.resolve(blob_id)?;
        let start = offset.min(blob.header.size);
        let end = offset.saturating_add(size).min(blob.header.size);

        let out = buffer.prepare(RecordFlags::PARTIAL, end - start)?;
        if !out.is_empty() {
            let address = stream_advance(self.page_size, blob.data_start(), start);
            read_chunk(&self.page_manager, None, address, out, true)?;
        }
        Ok(out.len())
    }

    fn read_bytes(&self, blob_id: BlobId, flags: RecordFlags) -> Result<Bytes> {
        if flags.contains(RecordFlags::USER_ALLOC) {
            return Err(AtlasError::Config(
                "read_bytes allocates its own buffer; use read with ReadBuffer::User".to_string(),
            ));
        }

        let blob = self.resolve(blob_id)?;
        let size = blob.header.size as usize;
        if size == 0 {
            return Ok(Bytes::new());
        }

        if flags.contains(RecordFlags::DIRECT_ACCESS) {
            if let Some(bytes) = read_direct(&self.page_manager, blob.data_start(), size)? {
                return Ok(bytes);
            }
        }

        let mut data = vec![0u8; size];
        read_chunk(&self.page_manager, None, blob.data_start(), &mut data, true)?;
        Ok(Bytes::from(data))
    }

    fn blob_size(&self, blob_id: BlobId) -> Result<u64> {
        Ok(self.resolve(blob_id)?.header.size)
    }

    fn overwrite(
        &mut self,
        old_blob_id: BlobId,
        record: &Record<'_>,
        flags: RecordFlags,
    ) -> Result<BlobId> {
        let old = self.resolve(old_blob_id)?;
        let (window_offset, new_size) = record.window(flags)?;
        let needed = self.footprint(new_size)?;

        if needed > old.header.allocated_size {
            return self.relocate(&old, record, flags);
        }

        let page = self.page_manager.fetch_page(old.page_address, false)?;
        let mut staged = Self::stage_header(&page);
        let mut allocated = old.header.allocated_size;
        let mut num_pages = old.num_pages;
        let mut released = Vec::new();
        let mut returned = None;

        {
            let mut page_header = BlobPageHeaderMut::new(staged.as_mut_slice());

            if num_pages > 1 {
                let keep = self.pages_for(needed) as u32;
                if keep < num_pages {
                    released = (keep..num_pages)
                        .map(|i| old.page_address + i as u64 * self.page_size as u64)
                        .collect();
                    num_pages = keep;
                    allocated = keep as u64 * self.usable as u64;
                    page_header.set_num_pages(keep);
                }
            }

            if num_pages == 1 {
                let leftover = allocated - needed;
                if leftover >= MIN_FREE_CHUNK as u64 {
                    let offset = old.offset + needed as u32;
                    let outcome = add_to_freelist(&mut page_header, offset, leftover as u32);
                    returned = Some((leftover as u32, outcome));
                    allocated = needed;
                }
            }
        }

        let header = BlobHeader {
            blob_id: old.id,
            allocated_size: allocated,
            size: new_size,
            flags: 0,
        };

        if flags.contains(RecordFlags::PARTIAL) {
            write_chunks(&self.page_manager, Some(&page), old.id, &[&header.encode()[..]])?;
            if new_size > old.header.size {
                let growth = vec![0u8; (new_size - old.header.size) as usize];
                let at = stream_advance(self.page_size, old.data_start(), old.header.size);
                write_chunks(&self.page_manager, Some(&page), at, &[&growth[..]])?;
            }
            let at = stream_advance(self.page_size, old.data_start(), window_offset);
            write_chunks(&self.page_manager, Some(&page), at, &[record.data])?;
        } else {
            write_chunks(
                &self.page_manager,
                Some(&page),
                old.id,
                &[&header.encode()[..], record.data],
            )?;
        }

        self.commit_header(&page, &staged)?;
        drop(page);

        if let Some((size, outcome)) = returned {
            self.report_leak(old.page_address, size, outcome);
        }
        for address in &released {
            self.page_manager.release_page(*address)?;
        }

        debug!(
            blob_id = old.id,
            size = new_size,
            allocated,
            released = released.len(),
            "overwrote blob in place"
        );
        Ok(old_blob_id)
    }

    fn erase(&mut self, blob_id: BlobId, _flags: RecordFlags) -> Result<()> {
        let blob = self.resolve(blob_id)?;
        let page = self.page_manager.fetch_page(blob.page_address, false)?;

        // Clear the self-reference so the id no longer resolves
        write_chunks(&self.page_manager, Some(&page), blob.id, &[&0u64.to_le_bytes()[..]])?;

        if blob.num_pages > 1 {
            drop(page);
            for i in 0..blob.num_pages as u64 {
                self.page_manager
                    .release_page(blob.page_address + i * self.page_size as u64)?;
            }
            debug!(blob_id = blob.id, pages = blob.num_pages, "erased multi-page blob");
            return Ok(());
        }

        let mut staged = Self::stage_header(&page);
        let size = blob.header.allocated_size as u32;
        let (outcome, free_bytes) = {
            let mut page_header = BlobPageHeaderMut::new(staged.as_mut_slice());
            let outcome = add_to_freelist(&mut page_header, blob.offset, size);
            (outcome, page_header.free_bytes())
        };
        self.report_leak(blob.page_address, size, outcome);

        if free_bytes == self.usable {
            drop(page);
            self.page_manager.release_page(blob.page_address)?;
            debug!(blob_id = blob.id, page = blob.page_address, "erased blob, page released");
        } else {
            self.commit_header(&page, &staged)?;
            self.page_manager.set_last_blob_page(Some(blob.page_address));
            debug!(blob_id = blob.id, free_bytes, "erased blob");
        }

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.page_manager.flush()
    }
}
