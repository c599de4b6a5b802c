//! Page buffer
//!
//! A fixed-size buffer backed either by owned memory or by a slice of the
//! read-only file mapping.

use std::ops::Range;

use bytes::Bytes;

use super::{PageType, PERSISTENT_HEADER_SIZE};

/// Backing storage of a page
#[derive(Debug)]
enum PageData {
    /// Zero-copy view into the file mapping, never written through
    Mapped(Bytes),

    /// Private buffer, the only form that can be modified
    Owned(Vec<u8>),
}

/// A single page of the data file
///
/// ## Layout
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────────────────────┐
/// │ Type (4) │ Rsvd (4) │ LSN (8)  │         Payload          │
/// └──────────┴──────────┴──────────┴──────────────────────────┘
/// ```
#[derive(Debug)]
pub struct Page {
    /// File offset of the first byte of the page
    address: u64,
    /// Page bytes (header + payload)
    data: PageData,
    /// Modified since the last write-back
    dirty: bool,
}

impl Page {
    /// Create a zeroed, owned page
    pub fn new(address: u64, page_size: usize) -> Self {
        Self {
            address,
            data: PageData::Owned(vec![0u8; page_size]),
            dirty: false,
        }
    }

    /// Wrap a buffer read from the file
    pub fn from_vec(address: u64, data: Vec<u8>) -> Self {
        Self {
            address,
            data: PageData::Owned(data),
            dirty: false,
        }
    }

    /// Wrap a slice of the file mapping
    pub fn mapped(address: u64, data: Bytes) -> Self {
        Self {
            address,
            data: PageData::Mapped(data),
            dirty: false,
        }
    }

    /// Zero the page and stamp its type
    pub fn initialize(&mut self, page_type: PageType) {
        self.raw_mut().fill(0);
        self.set_page_type(page_type);
    }

    /// File offset of the page
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Page size in bytes
    pub fn size(&self) -> usize {
        self.raw().len()
    }

    /// Whole page, including the persistent header
    pub fn raw(&self) -> &[u8] {
        match &self.data {
            PageData::Mapped(bytes) => bytes,
            PageData::Owned(vec) => vec,
        }
    }

    /// Whole page for writing; detaches a mapped page and marks it dirty
    pub fn raw_mut(&mut self) -> &mut [u8] {
        if let PageData::Mapped(bytes) = &self.data {
            self.data = PageData::Owned(bytes.to_vec());
        }
        self.dirty = true;
        match &mut self.data {
            PageData::Owned(vec) => vec,
            PageData::Mapped(_) => unreachable!("mapped page detached above"),
        }
    }

    /// Payload after the persistent header
    pub fn payload(&self) -> &[u8] {
        &self.raw()[PERSISTENT_HEADER_SIZE..]
    }

    /// Payload for writing
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.raw_mut()[PERSISTENT_HEADER_SIZE..]
    }

    /// Raw page type field
    pub fn page_type_raw(&self) -> u32 {
        u32::from_le_bytes(self.raw()[0..4].try_into().unwrap())
    }

    /// Decoded page type, `None` for unknown values
    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u32(self.page_type_raw())
    }

    /// Set the page type
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.raw_mut()[0..4].copy_from_slice(&(page_type as u32).to_le_bytes());
    }

    /// Log sequence number of the last change (unused by the blob layer)
    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.raw()[8..16].try_into().unwrap())
    }

    /// Set the log sequence number
    pub fn set_lsn(&mut self, lsn: u64) {
        self.raw_mut()[8..16].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Whether the page was modified since the last write-back
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the page dirty or clean
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Whether the page is still a view of the file mapping
    pub fn is_mapped(&self) -> bool {
        matches!(self.data, PageData::Mapped(_))
    }

    /// Zero-copy slice of a mapped page; `None` once the page was detached
    pub fn mapped_slice(&self, range: Range<usize>) -> Option<Bytes> {
        match &self.data {
            PageData::Mapped(bytes) => Some(bytes.slice(range)),
            PageData::Owned(_) => None,
        }
    }
}
