//! OS Module
//!
//! Thin wrapper around the single data file.
//!
//! ## Responsibilities
//! - Create/open the data file
//! - Positional reads and writes (no shared cursor)
//! - Read-only, copy-on-write memory mapping for direct-access reads
//! - Truncate and flush
//!
//! Nothing above the page layer touches the file directly.

mod file;

pub use file::File;
