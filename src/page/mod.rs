//! Page Module
//!
//! Fixed-size pages of the data file and the manager that caches them.
//!
//! ## Responsibilities
//! - Fixed-size page buffers with a persistent header
//! - Page cache with pinning (`Arc<RwLock<Page>>`) and eviction
//! - Allocation of single and contiguous pages, free page pool
//! - Persisting manager state in the file header page
//!
//! ## File Layout
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Page 0: file header                    │
//! │ ┌──────────────────┬─────────────────┐ │
//! │ │ Persistent (16)  │ Len | CRC | Hdr │ │
//! │ └──────────────────┴─────────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Page 1..N                              │
//! │ ┌──────────────────┬─────────────────┐ │
//! │ │ Persistent (16)  │    Payload      │ │
//! │ └──────────────────┴─────────────────┘ │
//! └────────────────────────────────────────┘
//!
//! Persistent header: page_type u32 | reserved u32 | lsn u64
//! ```

mod buffer;
mod header;
mod manager;

pub use buffer::Page;
pub use header::{FileHeader, FreeRun};
pub use manager::{PageManager, PageRef};

/// Size of the persistent header at the start of every page
pub const PERSISTENT_HEADER_SIZE: usize = 16;

/// What a page is used for, stored in its persistent header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    /// In the free page pool
    Free = 0,

    /// Page 0, holds the page manager state
    FileHeader = 1,

    /// Holds blob data (a blob page header follows the persistent header)
    Blob = 2,
}

impl PageType {
    /// Decode a stored page type
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::FileHeader),
            2 => Some(PageType::Blob),
            _ => None,
        }
    }
}
