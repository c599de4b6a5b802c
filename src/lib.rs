//! # AtlasBlob
//!
//! Page-based blob storage for a disk-resident key-value engine:
//! - Variable-length blobs stored inside fixed-size pages
//! - A bounded per-page free-list with best-fit allocation and coalescing
//! - Blobs spanning several contiguous pages
//! - In-place overwrite when the existing allocation is large enough
//! - Zero-copy reads from a memory-mapped data file
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        BlobStore                             │
//! │              (open file, pick backend, check)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  Box<dyn BlobManager>
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────┐
//!   │ DiskBlob    │          │  InMemory    │
//!   │ Manager     │          │  BlobManager │
//!   └──────┬──────┘          └──────────────┘
//!          │ free-lists, chunked I/O
//!          ▼
//!   ┌─────────────┐
//!   │ PageManager │  cache, free page pool, header page
//!   └──────┬──────┘
//!          ▼
//!   ┌─────────────┐
//!   │    File     │  pread/pwrite, mmap
//!   └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod os;
pub mod page;
pub mod blob;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{Backend, Config};
pub use blob::{BlobId, BlobManager, ReadBuffer, Record, RecordFlags};
pub use store::BlobStore;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasBlob
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
