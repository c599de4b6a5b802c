//! Page Manager
//!
//! Caches pages of the data file and hands out new ones.
//!
//! ## Responsibilities
//! - Fetch pages by file offset (from the mapping or with a positional read)
//! - Allocate single pages and contiguous runs, reusing the free page pool
//! - Release pages back to the pool
//! - Write back dirty pages and the file header on flush
//! - Truncate trailing free pages on close

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::os::File;

use super::header::{FileHeader, FRAME_SIZE};
use super::{Page, PageType, PERSISTENT_HEADER_SIZE};

/// A pinned page. Holding the `Arc` keeps the page in the cache.
pub type PageRef = Arc<RwLock<Page>>;

/// Manages the pages of one data file
///
/// ## Concurrency:
/// - `state`: Protected by Mutex (cache map, free pool, counters)
/// - Pages: each behind its own RwLock, pinned by cloning the `Arc`
/// - All methods use `&self` (callers serialize writers)
pub struct PageManager {
    /// The data file
    file: File,

    /// Page size, fixed when the file was created
    page_size: usize,

    /// Read-only mapping of the file as it was when opened
    mapping: Option<Bytes>,

    /// Clean pages kept before eviction
    cache_capacity: usize,

    /// Upper bound on the page count (0 = unlimited)
    max_pages: u64,

    /// Mutable bookkeeping
    state: Mutex<State>,
}

struct State {
    /// Cached pages by address
    cache: HashMap<u64, PageRef>,

    /// Free page pool, ascending addresses
    free_pages: BTreeSet<u64>,

    /// Hint for small blob allocations
    last_blob_page: Option<u64>,

    /// Number of pages in the file, including page 0
    page_count: u64,

    /// Mapped pages rewritten since open; reloaded with pread
    stale_mapped: HashSet<u64>,

    /// File header needs rewriting
    header_dirty: bool,

    /// `close()` already ran
    closed: bool,
}

impl PageManager {
    /// Open the page manager over `file`
    ///
    /// On an empty file a new header page is written with the configured
    /// page size. On an existing file the stored page size wins.
    pub fn open(file: File, config: &Config) -> Result<Self> {
        config.validate()?;

        let file_size = file.file_size()?;

        let (page_size, header) = if file_size == 0 {
            if file.is_read_only() {
                return Err(AtlasError::Config(
                    "cannot initialize an empty file opened read-only".to_string(),
                ));
            }
            info!(path = %file.path().display(), page_size = config.page_size, "creating data file");
            (config.page_size, FileHeader::new(config.page_size as u32))
        } else {
            let header = Self::read_header(&file)?;
            let page_size = header.page_size as usize;
            if page_size != config.page_size {
                info!(
                    configured = config.page_size,
                    stored = page_size,
                    "using page size stored in the data file"
                );
            }
            if file_size % page_size as u64 != 0 {
                return Err(AtlasError::Corruption(format!(
                    "file size {} is not a multiple of the page size {}",
                    file_size, page_size
                )));
            }
            (page_size, header)
        };

        let page_count = (file_size / page_size as u64).max(1);

        let free_pages: BTreeSet<u64> = if header.scan_free_pages {
            Self::scan_free_pages(&file, page_size, page_count)?
        } else {
            header
                .free_pages()
                .filter(|&addr| addr != 0 && addr < page_count * page_size as u64)
                .collect()
        };

        let mapping = if config.enable_mmap && file_size > 0 {
            let map = file.mmap(0, file_size as usize)?;
            Some(Bytes::from_owner(map))
        } else {
            None
        };

        let manager = Self {
            file,
            page_size,
            mapping,
            cache_capacity: config.cache_capacity,
            max_pages: config.max_pages,
            state: Mutex::new(State {
                cache: HashMap::new(),
                free_pages,
                last_blob_page: header.last_blob_page,
                page_count,
                stale_mapped: HashSet::new(),
                header_dirty: file_size == 0,
                closed: false,
            }),
        };

        if file_size == 0 {
            manager.write_header()?;
            manager.file.flush()?;
        }

        info!(
            page_size,
            page_count,
            mapped = manager.mapping.is_some(),
            "page manager opened"
        );

        Ok(manager)
    }

    /// Fetch a page by address, loading it on a cache miss
    ///
    /// `read_only` fetches are allowed on a read-only file; fetching for
    /// writing there fails.
    pub fn fetch_page(&self, address: u64, read_only: bool) -> Result<PageRef> {
        if !read_only && self.file.is_read_only() {
            return Err(AtlasError::Config("data file is read-only".to_string()));
        }

        let mut state = self.state.lock();

        if !Self::is_live(&state, self.page_size, address) {
            return Err(AtlasError::Corruption(format!(
                "page address {:#x} is not an allocated page",
                address
            )));
        }

        if let Some(page) = state.cache.get(&address) {
            return Ok(Arc::clone(page));
        }

        let page = self.load_page(&state, address)?;
        let page = Arc::new(RwLock::new(page));
        state.cache.insert(address, Arc::clone(&page));
        self.evict(&mut state)?;

        Ok(page)
    }

    /// Allocate one page, reusing the lowest free page first
    pub fn alloc_page(&self, page_type: PageType) -> Result<PageRef> {
        self.ensure_writable()?;

        let mut state = self.state.lock();

        let address = match state.free_pages.pop_first() {
            Some(address) => address,
            None => self.append_pages(&mut state, 1)?,
        };

        debug!(address, ?page_type, "allocated page");
        let page = self.install_new_page(&mut state, address, page_type);
        self.evict(&mut state)?;
        Ok(page)
    }

    /// Allocate `count` pages at consecutive addresses
    ///
    /// Returns the pinned pages in address order.
    pub fn alloc_contiguous(&self, count: usize, page_type: PageType) -> Result<Vec<PageRef>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.ensure_writable()?;

        let mut state = self.state.lock();
        let page_size = self.page_size as u64;

        let start = match Self::find_free_run(&state.free_pages, count, page_size) {
            Some(start) => {
                for i in 0..count as u64 {
                    state.free_pages.remove(&(start + i * page_size));
                }
                start
            }
            None => self.append_pages(&mut state, count as u64)?,
        };

        debug!(start, count, ?page_type, "allocated contiguous pages");

        let pages = (0..count as u64)
            .map(|i| self.install_new_page(&mut state, start + i * page_size, page_type))
            .collect();
        self.evict(&mut state)?;

        Ok(pages)
    }

    /// Return a page to the free page pool
    pub fn release_page(&self, address: u64) -> Result<()> {
        self.ensure_writable()?;

        let mut state = self.state.lock();

        if !Self::is_live(&state, self.page_size, address) {
            return Err(AtlasError::Corruption(format!(
                "cannot release page {:#x}: not an allocated page",
                address
            )));
        }

        // Replacing the cached entry drops the old buffer; the new one
        // carries the Free type to disk on the next flush.
        self.install_new_page(&mut state, address, PageType::Free);
        state.free_pages.insert(address);
        if state.last_blob_page == Some(address) {
            state.last_blob_page = None;
        }
        state.header_dirty = true;

        debug!(address, "released page");
        Ok(())
    }

    /// Page last used for small blob allocations
    pub fn last_blob_page(&self) -> Option<u64> {
        self.state.lock().last_blob_page
    }

    /// Set the page tried first for small blob allocations
    pub fn set_last_blob_page(&self, address: Option<u64>) {
        let mut state = self.state.lock();
        if state.last_blob_page != address {
            state.last_blob_page = address;
            state.header_dirty = true;
        }
    }

    /// Whether `address` is an allocated (not free) page other than page 0
    pub fn is_allocated(&self, address: u64) -> bool {
        let state = self.state.lock();
        Self::is_live(&state, self.page_size, address)
    }

    /// Addresses of all allocated pages except page 0, ascending
    pub fn allocated_pages(&self) -> Vec<u64> {
        let state = self.state.lock();
        (1..state.page_count)
            .map(|i| i * self.page_size as u64)
            .filter(|addr| !state.free_pages.contains(addr))
            .collect()
    }

    /// Write back dirty pages and the file header, then sync
    pub fn flush(&self) -> Result<()> {
        if self.file.is_read_only() {
            return Ok(());
        }

        let mut state = self.state.lock();

        let mut written = Vec::new();
        for page in state.cache.values() {
            let mut page = page.write();
            if page.is_dirty() {
                self.file.pwrite(page.address(), page.raw())?;
                page.set_dirty(false);
                written.push(page.address());
            }
        }
        for address in written {
            self.mark_stale(&mut state, address);
        }

        // Pages appended but never cached (evicted after write-back) are
        // already on disk; make sure the file covers the full page count.
        let expected = state.page_count * self.page_size as u64;
        if self.file.file_size()? < expected {
            self.file.truncate(expected)?;
        }

        if state.header_dirty {
            drop(state);
            self.write_header()?;
        }

        self.file.flush()?;
        Ok(())
    }

    /// Flush, give trailing free pages back to the filesystem, flush again
    ///
    /// Only pages beyond the mapped range are truncated: a mapping must not
    /// outlive the bytes it covers.
    pub fn close(&self) -> Result<()> {
        if self.state.lock().closed {
            return Ok(());
        }

        self.flush()?;

        if !self.file.is_read_only() {
            let reclaimed = self.reclaim_space();
            if reclaimed > 0 {
                let state = self.state.lock();
                let new_size = state.page_count * self.page_size as u64;
                drop(state);
                self.file.truncate(new_size)?;
                self.write_header()?;
                self.file.flush()?;
                info!(reclaimed, new_size, "truncated trailing free pages");
            }
        }

        self.state.lock().closed = true;
        info!("page manager closed");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the file, including the header page
    pub fn page_count(&self) -> u64 {
        self.state.lock().page_count
    }

    /// Number of pages in the free page pool
    pub fn free_page_count(&self) -> usize {
        self.state.lock().free_pages.len()
    }

    /// Number of pages currently cached
    pub fn cached_page_count(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Whether the data file is mapped
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the data file is read-only
    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_writable(&self) -> Result<()> {
        if self.file.is_read_only() {
            return Err(AtlasError::Config("data file is read-only".to_string()));
        }
        Ok(())
    }

    fn is_live(state: &State, page_size: usize, address: u64) -> bool {
        address != 0
            && address % page_size as u64 == 0
            && address / (page_size as u64) < state.page_count
            && !state.free_pages.contains(&address)
    }

    /// Grow the file by `count` pages, returning the first new address
    fn append_pages(&self, state: &mut State, count: u64) -> Result<u64> {
        if self.max_pages > 0 && state.page_count + count > self.max_pages {
            return Err(AtlasError::OutOfSpace(format!(
                "page limit of {} reached ({} in use, {} requested)",
                self.max_pages, state.page_count, count
            )));
        }

        let start = state.page_count * self.page_size as u64;
        state.page_count += count;
        state.header_dirty = true;
        Ok(start)
    }

    /// Put a zeroed, dirty page of `page_type` into the cache
    fn install_new_page(&self, state: &mut State, address: u64, page_type: PageType) -> PageRef {
        let mut page = Page::new(address, self.page_size);
        page.initialize(page_type);
        let page = Arc::new(RwLock::new(page));
        state.cache.insert(address, Arc::clone(&page));
        state.header_dirty = true;
        page
    }

    fn load_page(&self, state: &State, address: u64) -> Result<Page> {
        let end = address as usize + self.page_size;
        if let Some(mapping) = &self.mapping {
            if end <= mapping.len() && !state.stale_mapped.contains(&address) {
                return Ok(Page::mapped(address, mapping.slice(address as usize..end)));
            }
        }

        let mut data = vec![0u8; self.page_size];
        self.file.pread(address, &mut data)?;
        Ok(Page::from_vec(address, data))
    }

    /// Drop unpinned pages while the cache is over capacity
    ///
    /// Clean pages go first; dirty ones are written back before eviction.
    fn evict(&self, state: &mut State) -> Result<()> {
        if state.cache.len() <= self.cache_capacity {
            return Ok(());
        }

        let unpinned = |page: &PageRef| Arc::strong_count(page) == 1;

        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        for (&address, page) in &state.cache {
            if !unpinned(page) {
                continue;
            }
            match page.try_read() {
                Some(guard) if guard.is_dirty() => dirty.push(address),
                Some(_) => clean.push(address),
                None => {}
            }
        }
        clean.sort_unstable();
        dirty.sort_unstable();
        if self.file.is_read_only() {
            dirty.clear();
        }

        for address in clean.into_iter().chain(dirty) {
            if state.cache.len() <= self.cache_capacity {
                break;
            }
            if let Some(page) = state.cache.remove(&address) {
                let mut page = page.write();
                if page.is_dirty() {
                    self.file.pwrite(address, page.raw())?;
                    page.set_dirty(false);
                    drop(page);
                    self.mark_stale(state, address);
                }
            }
        }

        Ok(())
    }

    /// Remember that the mapping no longer matches the file at `address`
    fn mark_stale(&self, state: &mut State, address: u64) {
        let mapped = self
            .mapping
            .as_ref()
            .map_or(false, |m| address as usize + self.page_size <= m.len());
        if mapped {
            state.stale_mapped.insert(address);
        }
    }

    /// First address of `count` consecutive free pages
    fn find_free_run(free_pages: &BTreeSet<u64>, count: usize, page_size: u64) -> Option<u64> {
        let mut run_start = None;
        let mut run_len = 0usize;
        let mut prev = None;

        for &address in free_pages {
            match prev {
                Some(p) if p + page_size == address => run_len += 1,
                _ => {
                    run_start = Some(address);
                    run_len = 1;
                }
            }
            if run_len == count {
                return run_start;
            }
            prev = Some(address);
        }

        None
    }

    /// Drop trailing free pages beyond the mapping; returns how many
    fn reclaim_space(&self) -> u64 {
        let mapped_pages = self
            .mapping
            .as_ref()
            .map(|m| m.len() as u64 / self.page_size as u64)
            .unwrap_or(1);

        let mut state = self.state.lock();
        let mut reclaimed = 0;

        while state.page_count > mapped_pages.max(1) {
            let last = (state.page_count - 1) * self.page_size as u64;
            if !state.free_pages.remove(&last) {
                break;
            }
            state.cache.remove(&last);
            state.page_count -= 1;
            reclaimed += 1;
        }

        if reclaimed > 0 {
            state.header_dirty = true;
        }
        reclaimed
    }

    fn read_header(file: &File) -> Result<FileHeader> {
        let mut prefix = [0u8; PERSISTENT_HEADER_SIZE + FRAME_SIZE];
        file.pread(0, &mut prefix)?;

        let page_type = u32::from_le_bytes(prefix[0..4].try_into().unwrap());
        if PageType::from_u32(page_type) != Some(PageType::FileHeader) {
            return Err(AtlasError::Corruption(format!(
                "page 0 is not a file header page (type {})",
                page_type
            )));
        }

        let len = FileHeader::body_len(&prefix[PERSISTENT_HEADER_SIZE..]);
        if len as u64 > file.file_size()? {
            return Err(AtlasError::Corruption(format!(
                "file header length {} exceeds the file size",
                len
            )));
        }

        let mut frame = vec![0u8; FRAME_SIZE + len];
        file.pread(PERSISTENT_HEADER_SIZE as u64, &mut frame)?;
        FileHeader::decode(&frame)
    }

    /// Rebuild the free page pool from the persistent page headers
    ///
    /// Released pages reach disk with type `Free` before the file header is
    /// written, so every page of that type belongs to the pool.
    fn scan_free_pages(file: &File, page_size: usize, page_count: u64) -> Result<BTreeSet<u64>> {
        let mut free_pages = BTreeSet::new();
        let mut prefix = [0u8; 4];

        for i in 1..page_count {
            let address = i * page_size as u64;
            file.pread(address, &mut prefix)?;
            if PageType::from_u32(u32::from_le_bytes(prefix)) == Some(PageType::Free) {
                free_pages.insert(address);
            }
        }

        info!(page_count, free = free_pages.len(), "rebuilt free page pool from page types");
        Ok(free_pages)
    }

    fn write_header(&self) -> Result<()> {
        let mut state = self.state.lock();

        let header = FileHeader {
            last_blob_page: state.last_blob_page,
            free_runs: FileHeader::runs_from_pages(
                state.free_pages.iter().copied(),
                self.page_size as u64,
            ),
            ..FileHeader::new(self.page_size as u32)
        };

        let frame = header.encode(self.page_size - PERSISTENT_HEADER_SIZE)?;

        let mut page = Page::new(0, self.page_size);
        page.initialize(PageType::FileHeader);
        page.payload_mut()[..frame.len()].copy_from_slice(&frame);
        self.file.pwrite(0, page.raw())?;

        state.header_dirty = false;
        Ok(())
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        if self.state.lock().closed || self.file.is_read_only() {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush pages on drop: {}", e);
        }
    }
}
