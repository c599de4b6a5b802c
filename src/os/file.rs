//! File handle
//!
//! Positional I/O and memory mapping over the data file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::error::Result;

/// Handle to the data file
///
/// Reads and writes are positional, so `&self` is enough for both and the
/// handle can be shared by the page manager without a cursor lock.
#[derive(Debug)]
pub struct File {
    /// Underlying OS handle
    inner: std::fs::File,
    /// Path the handle was opened from (for logging)
    path: PathBuf,
    /// Opened without write access
    read_only: bool,
}

impl File {
    /// Create a new file, truncating any existing one
    pub fn create(path: &Path) -> Result<Self> {
        let inner = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Open an existing file
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let inner = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            read_only,
        })
    }

    /// Positional read of exactly `buffer.len()` bytes at `addr`
    pub fn pread(&self, addr: u64, buffer: &mut [u8]) -> Result<()> {
        read_exact_at(&self.inner, buffer, addr)?;
        Ok(())
    }

    /// Positional write of all of `buffer` at `addr`
    pub fn pwrite(&self, addr: u64, buffer: &[u8]) -> Result<()> {
        write_all_at(&self.inner, buffer, addr)?;
        Ok(())
    }

    /// Map `size` bytes starting at `position` into memory
    ///
    /// The mapping is private and read-only: it is a view of the file, and
    /// writing pages never goes through it.
    pub fn mmap(&self, position: u64, size: usize) -> Result<Mmap> {
        // SAFETY: the mapping is private (copy-on-write) and read-only. The
        // file is owned by this process for the lifetime of the store, and
        // positional writes only ever target pages that the page manager
        // serves from owned buffers afterwards.
        let map = unsafe {
            MmapOptions::new()
                .offset(position)
                .len(size)
                .map_copy_read_only(&self.inner)?
        };
        Ok(map)
    }

    /// Allocation granularity of the OS, mapping offsets must be a multiple
    pub fn granularity() -> usize {
        if cfg!(windows) {
            64 * 1024
        } else {
            4096
        }
    }

    /// Size of the file in bytes
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    /// Truncate or extend the file
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        self.inner.set_len(new_size)?;
        Ok(())
    }

    /// Flush data and metadata to stable storage
    pub fn flush(&self) -> Result<()> {
        self.inner.sync_all()?;
        Ok(())
    }

    /// Whether the file was opened without write access
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &std::fs::File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
