// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program images and the segment loader.
//!
//! A [`Program`] is a pre-parsed image: an entry point and a list of
//! segments with their bytes. The loader allocates fresh frames for each
//! segment, copies the bytes in and maps them user-visible, writable only
//! where the segment says so. Trailing space in the last frame of a
//! segment stays zero, which is how bss gets its zeros.

use alloc::vec::Vec;
use core::fmt;

use crate::mm::phys::{PageOwner, PhysMemory};
use crate::mm::{
    page_address, MapError, PageFlags, PageTable, MEMSIZE_VIRTUAL, PAGE_SIZE, PROC_START_ADDR,
};
use crate::types::Pid;

/// One loadable segment.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Page-aligned first virtual address.
    pub va: usize,
    /// Segment bytes; the in-memory size is this rounded up to a page.
    pub data: Vec<u8>,
    pub writable: bool,
}

/// A pre-parsed program image.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum LoaderError {
    /// Segment start not page-aligned.
    Unaligned,
    /// Segment or entry point outside the process region.
    OutOfRange,
    /// Segment collides with an existing mapping.
    Overlap,
    /// No free frame for segment bytes.
    Exhausted,
    Mapping(MapError),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Unaligned => write!(f, "segment start not page-aligned"),
            LoaderError::OutOfRange => write!(f, "segment outside the process region"),
            LoaderError::Overlap => write!(f, "segment overlaps an existing mapping"),
            LoaderError::Exhausted => write!(f, "out of physical memory"),
            LoaderError::Mapping(e) => write!(f, "segment mapping failed: {e}"),
        }
    }
}

impl From<MapError> for LoaderError {
    fn from(e: MapError) -> Self {
        LoaderError::Mapping(e)
    }
}

/// Loads `program` into `table`, charging every frame to `pid`.
///
/// Validates all segments before touching the arena; a failure after
/// that point leaves already-loaded pages attributed to `pid` for the
/// caller's rollback sweep.
pub(crate) fn load(
    phys: &mut PhysMemory,
    table: &PageTable,
    pid: Pid,
    program: &Program,
) -> Result<(), LoaderError> {
    if !(PROC_START_ADDR..MEMSIZE_VIRTUAL).contains(&program.entry) {
        return Err(LoaderError::OutOfRange);
    }
    for seg in &program.segments {
        if seg.va % PAGE_SIZE != 0 {
            return Err(LoaderError::Unaligned);
        }
        let pages = seg.data.len().div_ceil(PAGE_SIZE);
        let end = seg.va.checked_add(pages * PAGE_SIZE).ok_or(LoaderError::OutOfRange)?;
        if seg.va < PROC_START_ADDR || end > MEMSIZE_VIRTUAL {
            return Err(LoaderError::OutOfRange);
        }
    }

    for seg in &program.segments {
        let mut perm = PageFlags::PRESENT | PageFlags::USER;
        if seg.writable {
            perm |= PageFlags::WRITABLE;
        }
        for (page, chunk) in seg.data.chunks(PAGE_SIZE).enumerate() {
            let va = seg.va + page * PAGE_SIZE;
            if table.lookup(phys, va).is_some() {
                return Err(LoaderError::Overlap);
            }
            let pn = phys
                .find_free_page(PageOwner::Process(pid))
                .ok_or(LoaderError::Exhausted)?;
            phys.page_bytes_mut(pn)[..chunk.len()].copy_from_slice(chunk);
            table.map(phys, va, page_address(pn), perm)?;
        }
    }
    Ok(())
}
