//! File header page
//!
//! Page manager state persisted in page 0.
//!
//! ## Format (after the persistent page header)
//! ```text
//! ┌──────────┬──────────┬──────────────────────────────────┐
//! │ Len (4)  │ CRC (4)  │ bincode(FileHeader), Len bytes   │
//! └──────────┴──────────┴──────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Magic bytes identifying an AtlasBlob data file
pub(crate) const MAGIC: [u8; 4] = *b"ATBL";

/// Current file format version
pub(crate) const VERSION: u32 = 1;

/// Len (4) + CRC (4)
pub(crate) const FRAME_SIZE: usize = 8;

/// `count` consecutive free pages starting at `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRun {
    pub start: u64,
    pub count: u64,
}

/// State of the page manager that survives a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Must equal `MAGIC`
    pub magic: [u8; 4],
    /// Format version
    pub version: u32,
    /// Page size the file was created with
    pub page_size: u32,
    /// Page last used for small blob allocations
    pub last_blob_page: Option<u64>,
    /// Free page pool as ascending runs; empty when `scan_free_pages` is set
    pub free_runs: Vec<FreeRun>,
    /// The runs did not fit in page 0; rebuild the pool from page types
    pub scan_free_pages: bool,
}

impl FileHeader {
    /// Header for a freshly created file
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            last_blob_page: None,
            free_runs: Vec::new(),
            scan_free_pages: false,
        }
    }

    /// Group ascending page addresses into runs
    pub fn runs_from_pages(pages: impl IntoIterator<Item = u64>, page_size: u64) -> Vec<FreeRun> {
        let mut runs: Vec<FreeRun> = Vec::new();
        for address in pages {
            match runs.last_mut() {
                Some(run) if run.start + run.count * page_size == address => run.count += 1,
                _ => runs.push(FreeRun { start: address, count: 1 }),
            }
        }
        runs
    }

    /// Page addresses covered by `free_runs`
    pub fn free_pages(&self) -> impl Iterator<Item = u64> + '_ {
        let page_size = self.page_size as u64;
        self.free_runs
            .iter()
            .flat_map(move |run| (0..run.count).map(move |i| run.start + i * page_size))
    }

    /// Encode into `capacity` bytes: length, CRC32, bincode body
    ///
    /// If the free runs do not fit, none are stored and `scan_free_pages`
    /// is set instead.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut header = self.clone();

        let mut body = bincode::serialize(&header)?;
        if FRAME_SIZE + body.len() > capacity && !header.free_runs.is_empty() {
            header.free_runs.clear();
            header.scan_free_pages = true;
            body = bincode::serialize(&header)?;
        }

        if FRAME_SIZE + body.len() > capacity {
            return Err(AtlasError::Serialization(format!(
                "file header needs {} bytes, page holds {}",
                FRAME_SIZE + body.len(),
                capacity
            )));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(FRAME_SIZE + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);

        Ok(out)
    }

    /// Length of the bincode body, read from the frame prefix
    pub fn body_len(frame: &[u8]) -> usize {
        u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize
    }

    /// Decode and validate a frame produced by `encode`
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_SIZE {
            return Err(AtlasError::Corruption(
                "file header frame truncated".to_string(),
            ));
        }

        let len = Self::body_len(frame);
        let expected_crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());

        let body = frame
            .get(FRAME_SIZE..FRAME_SIZE + len)
            .ok_or_else(|| AtlasError::Corruption("file header body truncated".to_string()))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            return Err(AtlasError::Corruption(format!(
                "file header CRC mismatch: stored {:#010x}, computed {:#010x}",
                expected_crc, actual_crc
            )));
        }

        let header: FileHeader = bincode::deserialize(body)?;

        if header.magic != MAGIC {
            return Err(AtlasError::Corruption(format!(
                "invalid file magic: expected ATBL, got {:?}",
                header.magic
            )));
        }

        if header.version != VERSION {
            return Err(AtlasError::Corruption(format!(
                "unsupported file version: {}",
                header.version
            )));
        }

        Ok(header)
    }
}
