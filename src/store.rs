//! Store Module
//!
//! Opens a data file from a `Config` and serves blobs through the backend
//! picked by `create_blob_manager`.
//!
//! ## Responsibilities
//! - Create or open the data file and its page manager
//! - Hold the selected `BlobManager`
//! - Page-level integrity check and statistics
//! - Flush and close

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::blob::{
    create_blob_manager, BlobId, BlobManager, DiskBlobManager, ReadBuffer, Record, RecordFlags,
};
use crate::config::{Backend, Config};
use crate::error::{AtlasError, Result};
use crate::os::File;
use crate::page::{PageManager, PageType};

/// Result of walking every page of the data file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Single-page blob pages and first pages of spans
    pub blob_pages: u64,
    /// Continuation pages of multi-page blobs
    pub continuation_pages: u64,
    /// Free bytes tracked by all free-lists
    pub free_bytes: u64,
    /// Pages that failed their check, with the reason
    pub problems: Vec<(u64, String)>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Point-in-time statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub backend: Backend,
    pub page_size: usize,
    pub page_count: u64,
    pub free_pages: usize,
    pub cached_pages: usize,
    pub mapped: bool,
}

/// A blob store over one data file (or memory)
pub struct BlobStore {
    config: Config,

    /// Present for the disk backend
    page_manager: Option<Arc<PageManager>>,

    manager: Box<dyn BlobManager>,
}

impl BlobStore {
    /// Open or create the store described by `config`
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let page_manager = match config.backend {
            Backend::Disk => {
                let exists = config
                    .data_path
                    .metadata()
                    .map(|m| m.len() > 0)
                    .unwrap_or(false);

                let file = if exists {
                    File::open(&config.data_path, config.read_only)?
                } else if config.read_only {
                    return Err(AtlasError::Config(format!(
                        "{} does not exist and the store is read-only",
                        config.data_path.display()
                    )));
                } else {
                    File::create(&config.data_path)?
                };

                Some(Arc::new(PageManager::open(file, &config)?))
            }
            Backend::InMemory => None,
        };

        let manager = create_blob_manager(config.backend, page_manager.clone())?;

        info!(backend = ?config.backend, path = %config.data_path.display(), "blob store opened");

        Ok(Self {
            config,
            page_manager,
            manager,
        })
    }

    // =========================================================================
    // Blob Operations
    // =========================================================================

    /// Store `data` as a new blob
    pub fn put(&mut self, data: &[u8]) -> Result<BlobId> {
        self.manager.allocate(&Record::new(data), RecordFlags::empty())
    }

    /// Read a whole blob
    pub fn get(&self, blob_id: BlobId) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.manager
            .read(blob_id, RecordFlags::empty(), ReadBuffer::Arena(&mut data))?;
        Ok(data)
    }

    /// Read a whole blob, zero-copy when the storage allows it
    pub fn get_bytes(&self, blob_id: BlobId) -> Result<Bytes> {
        self.manager.read_bytes(blob_id, RecordFlags::DIRECT_ACCESS)
    }

    /// Logical size of a blob
    pub fn size(&self, blob_id: BlobId) -> Result<u64> {
        self.manager.blob_size(blob_id)
    }

    /// Replace a blob; returns its (possibly new) id
    pub fn replace(&mut self, blob_id: BlobId, data: &[u8]) -> Result<BlobId> {
        self.manager
            .overwrite(blob_id, &Record::new(data), RecordFlags::empty())
    }

    /// Delete a blob
    pub fn remove(&mut self, blob_id: BlobId) -> Result<()> {
        self.manager.erase(blob_id, RecordFlags::empty())
    }

    /// The underlying blob manager, for flag-driven operations
    pub fn manager(&self) -> &dyn BlobManager {
        self.manager.as_ref()
    }

    /// The underlying blob manager, for flag-driven operations
    pub fn manager_mut(&mut self) -> &mut dyn BlobManager {
        self.manager.as_mut()
    }

    /// Page manager of the disk backend
    pub fn page_manager(&self) -> Option<&Arc<PageManager>> {
        self.page_manager.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Verify every allocated page
    ///
    /// The in-memory backend has no pages and always reports success.
    pub fn check(&self) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let Some(page_manager) = &self.page_manager else {
            return Ok(report);
        };

        let inspector = DiskBlobManager::new(Arc::clone(page_manager));
        let mut expected_continuations = 0u64;

        for address in page_manager.allocated_pages() {
            let page_type = page_manager.fetch_page(address, true)?.read().page_type();
            if page_type != Some(PageType::Blob) {
                report
                    .problems
                    .push((address, format!("allocated page has type {:?}", page_type)));
                continue;
            }

            match inspector.inspect_page(address) {
                Ok(info) if info.num_pages == 0 => {
                    if expected_continuations == 0 {
                        report
                            .problems
                            .push((address, "continuation page without a span".to_string()));
                    } else {
                        expected_continuations -= 1;
                    }
                    report.continuation_pages += 1;
                }
                Ok(info) => {
                    if expected_continuations > 0 {
                        report
                            .problems
                            .push((address, "span ended early".to_string()));
                    }
                    expected_continuations = info.num_pages as u64 - 1;
                    report.blob_pages += 1;
                    report.free_bytes += info.free_bytes as u64;
                }
                Err(e) => report.problems.push((address, e.to_string())),
            }
        }

        if !report.is_ok() {
            warn!(problems = report.problems.len(), "integrity check found problems");
        }
        Ok(report)
    }

    /// Current statistics
    pub fn stats(&self) -> StoreStats {
        match &self.page_manager {
            Some(pm) => StoreStats {
                backend: self.config.backend,
                page_size: pm.page_size(),
                page_count: pm.page_count(),
                free_pages: pm.free_page_count(),
                cached_pages: pm.cached_page_count(),
                mapped: pm.is_mapped(),
            },
            None => StoreStats {
                backend: self.config.backend,
                page_size: self.config.page_size,
                page_count: 0,
                free_pages: 0,
                cached_pages: 0,
                mapped: false,
            },
        }
    }

    /// Persist all buffered changes
    pub fn flush(&self) -> Result<()> {
        self.manager.flush()
    }

    /// Flush and release trailing free pages
    pub fn close(self) -> Result<()> {
        self.manager.flush()?;
        if let Some(pm) = &self.page_manager {
            pm.close()?;
        }
        info!("blob store closed");
        Ok(())
    }
}
