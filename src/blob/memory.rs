//! In-memory blob manager
//!
//! Blobs live in a map keyed by ids handed out in increasing order, starting
//! at 1. Ids are never reused.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::error::{AtlasError, Result};

use super::{BlobId, BlobManager, ReadBuffer, Record, RecordFlags};

#[derive(Debug, Clone)]
struct MemoryBlob {
    data: Bytes,
    /// Largest size the blob may grow to without a new id
    allocated: u64,
}

/// `BlobManager` without pages or files
#[derive(Debug)]
pub struct InMemoryBlobManager {
    blobs: HashMap<BlobId, MemoryBlob>,
    next_id: u64,
}

impl InMemoryBlobManager {
    pub fn new() -> Self {
        Self {
            blobs: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of live blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn get(&self, blob_id: BlobId) -> Result<&MemoryBlob> {
        self.blobs
            .get(&blob_id)
            .ok_or(AtlasError::InvalidBlobId(blob_id.as_u64()))
    }

    /// Materialize the full contents of a record
    fn assemble(record: &Record<'_>, flags: RecordFlags, base: Option<&[u8]>) -> Result<Vec<u8>> {
        let (offset, size) = record.window(flags)?;
        if !flags.contains(RecordFlags::PARTIAL) {
            return Ok(record.data.to_vec());
        }

        let mut data = vec![0u8; size as usize];
        if let Some(base) = base {
            let keep = base.len().min(data.len());
            data[..keep].copy_from_slice(&base[..keep]);
        }
        let start = offset as usize;
        data[start..start + record.data.len()].copy_from_slice(record.data);
        Ok(data)
    }
}

impl Default for InMemoryBlobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobManager for InMemoryBlobManager {
    fn allocate(&mut self, record: &Record<'_>, flags: RecordFlags) -> Result<BlobId> {
        let data = Self::assemble(record, flags, None)?;
        let id = BlobId::new(self.next_id);
        self.next_id += 1;

        debug!(blob_id = id.as_u64(), size = data.len(), "allocated in-memory blob");
        self.blobs.insert(
            id,
            MemoryBlob {
                allocated: data.len() as u64,
                data: Bytes::from(data),
            },
        );
        Ok(id)
    }

    fn read(&self, blob_id: BlobId, flags: RecordFlags, buffer: ReadBuffer<'_>) -> Result<usize> {
        let blob = self.get(blob_id)?;
        let out = buffer.prepare(flags, blob.data.len() as u64)?;
        out.copy_from_slice(&blob.data);
        Ok(out.len())
    }

    fn read_partial(
        &self,
        blob_id: BlobId,
        offset: u64,
        size: u64,
        buffer: ReadBuffer<'_>,
    ) -> Result<usize> {
        let blob = self.get(blob_id)?;
        let len = blob.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(size).min(len) as usize;

        let out = buffer.prepare(RecordFlags::PARTIAL, (end - start) as u64)?;
        out.copy_from_slice(&blob.data[start..end]);
        Ok(out.len())
    }

    fn read_bytes(&self, blob_id: BlobId, flags: RecordFlags) -> Result<Bytes> {
        if flags.contains(RecordFlags::USER_ALLOC) {
            return Err(AtlasError::Config(
                "read_bytes allocates its own buffer; use read with ReadBuffer::User".to_string(),
            ));
        }

        let blob = self.get(blob_id)?;
        if flags.contains(RecordFlags::DIRECT_ACCESS) {
            Ok(blob.data.clone())
        } else {
            Ok(Bytes::copy_from_slice(&blob.data))
        }
    }

    fn blob_size(&self, blob_id: BlobId) -> Result<u64> {
        Ok(self.get(blob_id)?.data.len() as u64)
    }

    fn overwrite(
        &mut self,
        old_blob_id: BlobId,
        record: &Record<'_>,
        flags: RecordFlags,
    ) -> Result<BlobId> {
        let old = self.get(old_blob_id)?;
        let data = Self::assemble(record, flags, Some(&old.data))?;

        if data.len() as u64 <= old.allocated {
            let allocated = old.allocated;
            self.blobs.insert(
                old_blob_id,
                MemoryBlob {
                    data: Bytes::from(data),
                    allocated,
                },
            );
            return Ok(old_blob_id);
        }

        self.blobs.remove(&old_blob_id);
        let new_id = self.allocate(&Record::new(&data), RecordFlags::empty())?;
        debug!(old = old_blob_id.as_u64(), new = new_id.as_u64(), "relocated in-memory blob");
        Ok(new_id)
    }

    fn erase(&mut self, blob_id: BlobId, _flags: RecordFlags) -> Result<()> {
        self.blobs
            .remove(&blob_id)
            .map(|_| ())
            .ok_or(AtlasError::InvalidBlobId(blob_id.as_u64()))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
