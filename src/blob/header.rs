//! Blob headers
//!
//! `BlobPageHeader` is a fixed-layout view over the first 264 bytes of a
//! blob page's payload. `BlobHeader` precedes every blob's bytes.
//!
//! ## BlobPageHeader Layout (264 bytes, little-endian)
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       4   num_pages
//!   4       4   free_bytes
//!   8     256   freelist: 32 x { offset u32, size u32 }
//! ```

use crate::error::{AtlasError, Result};

use super::{BLOB_HEADER_SIZE, BLOB_PAGE_HEADER_SIZE, FREELIST_ENTRIES};

const NUM_PAGES_OFFSET: usize = 0;
const FREE_BYTES_OFFSET: usize = 4;
const FREELIST_OFFSET: usize = 8;

/// A free byte range inside a page's usable area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreelistEntry {
    pub offset: u32,
    pub size: u32,
}

impl FreelistEntry {
    /// One past the last free byte
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// View of a blob page header
///
/// `B` is `&[u8]` for reading or `&mut [u8]` for reading and writing.
#[derive(Debug)]
pub struct BlobPageHeader<B> {
    data: B,
}

/// Read-only view over page bytes
pub type BlobPageHeaderRef<'a> = BlobPageHeader<&'a [u8]>;

/// Read/write view over page bytes
pub type BlobPageHeaderMut<'a> = BlobPageHeader<&'a mut [u8]>;

impl<B: AsRef<[u8]>> BlobPageHeader<B> {
    /// Creates a view over the given buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `BLOB_PAGE_HEADER_SIZE`.
    pub fn new(data: B) -> Self {
        assert!(
            data.as_ref().len() >= BLOB_PAGE_HEADER_SIZE,
            "buffer too small for blob page header"
        );
        Self { data }
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.data.as_ref()[at..at + 4].try_into().unwrap())
    }

    /// Number of pages governed by this header
    pub fn num_pages(&self) -> u32 {
        self.read_u32(NUM_PAGES_OFFSET)
    }

    /// The "free bytes" counter
    pub fn free_bytes(&self) -> u32 {
        self.read_u32(FREE_BYTES_OFFSET)
    }

    /// Total number of free-list slots
    pub fn freelist_entries(&self) -> usize {
        FREELIST_ENTRIES
    }

    /// Offset of free-list slot `i`
    pub fn freelist_offset(&self, i: usize) -> u32 {
        self.read_u32(FREELIST_OFFSET + i * 8)
    }

    /// Size of free-list slot `i` (0 = unused slot)
    pub fn freelist_size(&self, i: usize) -> u32 {
        self.read_u32(FREELIST_OFFSET + i * 8 + 4)
    }

    /// Live entries in slot order
    pub fn entries(&self) -> Vec<FreelistEntry> {
        (0..FREELIST_ENTRIES)
            .filter(|&i| self.freelist_size(i) > 0)
            .map(|i| FreelistEntry {
                offset: self.freelist_offset(i),
                size: self.freelist_size(i),
            })
            .collect()
    }

    /// Verify the free-list against `free_bytes` and the usable area
    ///
    /// Fails if the entry sizes do not add up to `free_bytes`, if two
    /// entries overlap, or if an entry reaches past `usable`.
    pub fn check_integrity(&self, usable: u32) -> Result<()> {
        let mut entries = self.entries();

        let total: u64 = entries.iter().map(|e| e.size as u64).sum();
        if total != self.free_bytes() as u64 {
            return Err(AtlasError::Corruption(format!(
                "free-list holds {} bytes but free_bytes is {}",
                total,
                self.free_bytes()
            )));
        }

        entries.sort_by_key(|e| e.offset);

        for entry in &entries {
            if entry.offset as u64 + entry.size as u64 > usable as u64 {
                return Err(AtlasError::Corruption(format!(
                    "free-list entry {}+{} exceeds usable size {}",
                    entry.offset, entry.size, usable
                )));
            }
        }

        for pair in entries.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(AtlasError::Corruption(format!(
                    "free-list entries {}+{} and {}+{} overlap",
                    pair[0].offset, pair[0].size, pair[1].offset, pair[1].size
                )));
            }
        }

        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BlobPageHeader<B> {
    fn write_u32(&mut self, at: usize, value: u32) {
        self.data.as_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Zero every field
    pub fn initialize(&mut self) {
        self.data.as_mut()[..BLOB_PAGE_HEADER_SIZE].fill(0);
    }

    /// Sets the number of pages governed by this header
    pub fn set_num_pages(&mut self, num_pages: u32) {
        self.write_u32(NUM_PAGES_OFFSET, num_pages);
    }

    /// Sets the "free bytes" counter
    pub fn set_free_bytes(&mut self, free_bytes: u32) {
        self.write_u32(FREE_BYTES_OFFSET, free_bytes);
    }

    /// Sets the offset of free-list slot `i`
    pub fn set_freelist_offset(&mut self, i: usize, offset: u32) {
        self.write_u32(FREELIST_OFFSET + i * 8, offset);
    }

    /// Sets the size of free-list slot `i`
    pub fn set_freelist_size(&mut self, i: usize, size: u32) {
        self.write_u32(FREELIST_OFFSET + i * 8 + 4, size);
    }

    /// Clear slot `i`
    pub(crate) fn clear_slot(&mut self, i: usize) {
        self.set_freelist_offset(i, 0);
        self.set_freelist_size(i, 0);
    }
}

/// Header stored in front of every blob's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// File offset of this header; zero once the blob is erased
    pub blob_id: u64,
    /// Bytes reserved for the blob, header included
    pub allocated_size: u64,
    /// Logical size of the blob's data
    pub size: u64,
    /// Reserved
    pub flags: u32,
}

impl BlobHeader {
    pub const SIZE: usize = BLOB_HEADER_SIZE;

    /// Serializes the header to bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.blob_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.allocated_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Deserializes a header from bytes.
    ///
    /// Returns `None` if the buffer is too small.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            blob_id: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            allocated_size: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            size: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            flags: u32::from_le_bytes(buf[24..28].try_into().ok()?),
        })
    }
}
