//! Blob Module
//!
//! Variable-length values stored inside pages of the data file.
//!
//! ## Responsibilities
//! - Per-page metadata with a bounded free-list (`header`)
//! - Carving space out of and returning space to that free-list (`freelist`)
//! - Reading/writing byte ranges across page boundaries (`chunk`)
//! - The `BlobManager` contract and its disk and in-memory backends
//!
//! ## Blob Page Layout
//! ```text
//! ┌─────────────────┬──────────────────────────┬─────────────────────────┐
//! │ Persistent (16) │ BlobPageHeader (264)     │ Usable area             │
//! │                 │ NumPages | FreeBytes |   │ [BlobHeader][payload].. │
//! │                 │ 32 x (Offset, Size)      │ free ranges ...         │
//! └─────────────────┴──────────────────────────┴─────────────────────────┘
//!
//! BlobHeader (28): BlobId (8) | AllocatedSize (8) | Size (8) | Flags (4)
//! ```
//!
//! A blob larger than one usable area occupies `n` contiguous pages. Each of
//! them keeps the 280 byte overhead; the blob's bytes run through the usable
//! areas in order. Only the first page's header is meaningful (`num_pages =
//! n`), continuation pages carry `num_pages = 0`.

mod chunk;
mod disk;
mod freelist;
mod header;
mod memory;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

use crate::config::Backend;
use crate::error::{AtlasError, Result};
use crate::page::{PageManager, PERSISTENT_HEADER_SIZE};

pub use disk::{BlobPageInfo, DiskBlobManager};
pub use freelist::FreelistInsert;
pub use header::{BlobHeader, BlobPageHeader, BlobPageHeaderMut, BlobPageHeaderRef, FreelistEntry};
pub use memory::InMemoryBlobManager;

// =============================================================================
// Layout Constants
// =============================================================================

/// Number of slots in a page's free-list
pub const FREELIST_ENTRIES: usize = 32;

/// NumPages (4) + FreeBytes (4) + 32 x (Offset (4) + Size (4)) = 264 bytes
pub const BLOB_PAGE_HEADER_SIZE: usize = 8 + FREELIST_ENTRIES * 8;

/// Bytes at the start of every blob page that hold no blob data
pub const PAGE_OVERHEAD: usize = PERSISTENT_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE;

/// BlobId (8) + AllocatedSize (8) + Size (8) + Flags (4) = 28 bytes
pub const BLOB_HEADER_SIZE: usize = 28;

/// Leftover space below this stays with the blob as padding on shrink
pub const MIN_FREE_CHUNK: u32 = 32;

/// Bytes available for blobs in one page
pub fn usable_size(page_size: usize) -> usize {
    page_size - PAGE_OVERHEAD
}

// =============================================================================
// Blob Ids, Records, Flags
// =============================================================================

/// Address of a blob: the file offset of its header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(u64);

impl BlobId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for BlobId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<BlobId> for u64 {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Flags accepted by blob operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u32 {
        /// Output buffer belongs to the caller and must not be resized
        const USER_ALLOC    = 0b001;
        /// Reads may return a zero-copy view of mapped storage
        const DIRECT_ACCESS = 0b010;
        /// The record only covers a window of the blob
        const PARTIAL       = 0b100;
    }
}

/// A value to store
///
/// With `RecordFlags::PARTIAL`, `data` is placed at `partial_offset` inside
/// a blob of `size` bytes. Without it, `data` is the whole blob.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Bytes to write
    pub data: &'a [u8],
    /// Logical blob size, used with `PARTIAL`
    pub size: u64,
    /// Start of `data` inside the blob, used with `PARTIAL`
    pub partial_offset: u64,
}

impl<'a> Record<'a> {
    /// A record holding the whole blob
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            size: data.len() as u64,
            partial_offset: 0,
        }
    }

    /// A record covering `[offset, offset + data.len())` of a blob of `size` bytes
    pub fn partial(data: &'a [u8], offset: u64, size: u64) -> Self {
        Self {
            data,
            size,
            partial_offset: offset,
        }
    }

    /// (window offset, logical size) for the given flags
    pub(crate) fn window(&self, flags: RecordFlags) -> Result<(u64, u64)> {
        if !flags.contains(RecordFlags::PARTIAL) {
            return Ok((0, self.data.len() as u64));
        }

        let fits = self
            .partial_offset
            .checked_add(self.data.len() as u64)
            .map_or(false, |end| end <= self.size);
        if !fits {
            return Err(AtlasError::Config(format!(
                "partial window of {} bytes at {} exceeds record size {}",
                self.data.len(),
                self.partial_offset,
                self.size
            )));
        }
        Ok((self.partial_offset, self.size))
    }
}

/// Where a read puts its bytes
///
/// Ownership is explicit: an arena may be resized by the manager, a user
/// buffer never is.
#[derive(Debug)]
pub enum ReadBuffer<'a> {
    /// Growable buffer; cleared and resized to the bytes read
    Arena(&'a mut Vec<u8>),

    /// Fixed buffer; the read fails if it is too small
    User(&'a mut [u8]),
}

impl<'a> ReadBuffer<'a> {
    /// Exactly `len` writable bytes of the buffer
    pub(crate) fn prepare(self, flags: RecordFlags, len: u64) -> Result<&'a mut [u8]> {
        match self {
            ReadBuffer::Arena(_) if flags.contains(RecordFlags::USER_ALLOC) => {
                Err(AtlasError::Config(
                    "USER_ALLOC reads need a ReadBuffer::User".to_string(),
                ))
            }
            ReadBuffer::Arena(vec) => {
                vec.clear();
                vec.resize(len as usize, 0);
                Ok(vec.as_mut_slice())
            }
            ReadBuffer::User(buf) => {
                if (buf.len() as u64) < len {
                    return Err(AtlasError::BufferTooSmall {
                        required: len,
                        available: buf.len() as u64,
                    });
                }
                Ok(&mut buf[..len as usize])
            }
        }
    }
}

// =============================================================================
// BlobManager Contract
// =============================================================================

/// Storage contract for blobs, used by the index layer
///
/// Mutating operations take `&mut self`: one writer at a time. Readers share
/// `&self`. Every operation either completes or returns an error without
/// changing free-list or header state.
pub trait BlobManager: Send + Sync {
    /// Store a new blob and return its id
    fn allocate(&mut self, record: &Record<'_>, flags: RecordFlags) -> Result<BlobId>;

    /// Read the whole blob into `buffer`; returns the number of bytes read
    fn read(&self, blob_id: BlobId, flags: RecordFlags, buffer: ReadBuffer<'_>) -> Result<usize>;

    /// Read `[offset, offset + size)` of the blob, clipped at its end
    fn read_partial(
        &self,
        blob_id: BlobId,
        offset: u64,
        size: u64,
        buffer: ReadBuffer<'_>,
    ) -> Result<usize>;

    /// Read the whole blob as `Bytes`
    ///
    /// With `DIRECT_ACCESS` the result may be a view of the storage itself.
    fn read_bytes(&self, blob_id: BlobId, flags: RecordFlags) -> Result<Bytes>;

    /// Logical size of the blob
    fn blob_size(&self, blob_id: BlobId) -> Result<u64>;

    /// Replace a blob's contents; the id changes if the blob was moved
    fn overwrite(&mut self, old_blob_id: BlobId, record: &Record<'_>, flags: RecordFlags)
        -> Result<BlobId>;

    /// Delete a blob and reclaim its space
    fn erase(&mut self, blob_id: BlobId, flags: RecordFlags) -> Result<()>;

    /// Persist buffered state
    fn flush(&self) -> Result<()>;
}

/// Build the blob manager for `backend`
///
/// The disk backend needs the page manager of the opened data file.
pub fn create_blob_manager(
    backend: Backend,
    page_manager: Option<Arc<PageManager>>,
) -> Result<Box<dyn BlobManager>> {
    match backend {
        Backend::Disk => {
            let page_manager = page_manager.ok_or_else(|| {
                AtlasError::Config("disk backend requires a page manager".to_string())
            })?;
            Ok(Box::new(DiskBlobManager::new(page_manager)))
        }
        Backend::InMemory => Ok(Box::new(InMemoryBlobManager::new())),
    }
}
