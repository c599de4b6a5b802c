//! Chunked I/O
//!
//! The bytes of a blob form one stream across the usable areas of one or
//! more consecutive pages. Every page keeps its first `PAGE_OVERHEAD` bytes,
//! so a stream that reaches the end of a page continues right after the
//! overhead of the next one.
//!
//! ```text
//!   page N                         page N+1
//! ┌──────────┬──────────────────┐┌──────────┬──────────────────┐
//! │ overhead │ .... stream ────>││ overhead │ ──> stream ....  │
//! └──────────┴──────────────────┘└──────────┴──────────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::page::{PageManager, PageRef};

use super::PAGE_OVERHEAD;

/// Normalize a stream address: an address inside a page's overhead moves to
/// the first usable byte of that page
pub(crate) fn stream_position(page_size: usize, address: u64) -> u64 {
    let in_page = address % page_size as u64;
    if in_page < PAGE_OVERHEAD as u64 {
        address - in_page + PAGE_OVERHEAD as u64
    } else {
        address
    }
}

/// Stream address `distance` bytes after `address`
pub(crate) fn stream_advance(page_size: usize, address: u64, distance: u64) -> u64 {
    let page_size = page_size as u64;
    let usable = page_size - PAGE_OVERHEAD as u64;

    let address = stream_position(page_size as usize, address);
    let in_page = address % page_size;
    let left_in_page = page_size - in_page;
    if distance < left_in_page {
        return address + distance;
    }

    let rest = distance - left_in_page;
    let page_start = address - in_page + page_size * (1 + rest / usable);
    page_start + PAGE_OVERHEAD as u64 + rest % usable
}

/// One contiguous piece of the stream inside a single page
struct Span {
    page_address: u64,
    in_page: usize,
    len: usize,
}

/// Split `len` stream bytes starting at `address` into per-page spans
fn spans(page_size: usize, address: u64, len: usize) -> impl Iterator<Item = Span> {
    let mut address = address;
    let mut remaining = len;

    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        address = stream_position(page_size, address);
        let in_page = (address % page_size as u64) as usize;
        let len = remaining.min(page_size - in_page);
        let span = Span {
            page_address: address - in_page as u64,
            in_page,
            len,
        };
        address += len as u64;
        remaining -= len;
        Some(span)
    })
}

/// Use the pinned page if it is the one at `address`, otherwise fetch it
fn page_at(
    page_manager: &PageManager,
    pinned: Option<&PageRef>,
    address: u64,
    read_only: bool,
) -> Result<PageRef> {
    if let Some(page) = pinned {
        if page.read().address() == address {
            return Ok(Arc::clone(page));
        }
    }
    page_manager.fetch_page(address, read_only)
}

/// Write the concatenation of `chunks` as a stream starting at `address`
///
/// The caller must not hold a lock on any page the stream touches.
pub(crate) fn write_chunks(
    page_manager: &PageManager,
    pinned: Option<&PageRef>,
    address: u64,
    chunks: &[&[u8]],
) -> Result<()> {
    let page_size = page_manager.page_size();
    let mut address = address;

    for chunk in chunks {
        let mut written = 0;
        for span in spans(page_size, address, chunk.len()) {
            let page = page_at(page_manager, pinned, span.page_address, false)?;
            let mut page = page.write();
            page.raw_mut()[span.in_page..span.in_page + span.len]
                .copy_from_slice(&chunk[written..written + span.len]);
            written += span.len;
        }
        address = stream_advance(page_size, address, chunk.len() as u64);
    }

    Ok(())
}

/// Fill `buf` from the stream starting at `address`
pub(crate) fn read_chunk(
    page_manager: &PageManager,
    pinned: Option<&PageRef>,
    address: u64,
    buf: &mut [u8],
    fetch_read_only: bool,
) -> Result<()> {
    let page_size = page_manager.page_size();
    let mut read = 0;

    for span in spans(page_size, address, buf.len()) {
        let page = page_at(page_manager, pinned, span.page_address, fetch_read_only)?;
        let page = page.read();
        buf[read..read + span.len].copy_from_slice(&page.raw()[span.in_page..span.in_page + span.len]);
        read += span.len;
    }

    Ok(())
}

/// Zero-copy view of `len` stream bytes at `address`
///
/// `None` if the range leaves its page or the page is not backed by the
/// file mapping.
pub(crate) fn read_direct(
    page_manager: &PageManager,
    address: u64,
    len: usize,
) -> Result<Option<Bytes>> {
    let page_size = page_manager.page_size();
    let address = stream_position(page_size, address);
    let in_page = (address % page_size as u64) as usize;
    if in_page + len > page_size {
        return Ok(None);
    }

    let page = page_manager.fetch_page(address - in_page as u64, true)?;
    let page = page.read();
    Ok(page.mapped_slice(in_page..in_page + len))
}
