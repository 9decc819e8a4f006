// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-address-space construction: the kernel's identity map and the
//! per-process copies derived from it.

use crate::mm::page_table::PageTable;
use crate::mm::phys::{PageOwner, PhysMemory};
use crate::mm::{
    MapError, PageFlags, CONSOLE_ADDR, MEMSIZE_VIRTUAL, PAGE_SIZE, PROC_START_ADDR,
};
use crate::types::Pid;

/// Maps `size` bytes page by page, `va..va+size` onto `pa..pa+size`.
pub fn map_range(
    phys: &mut PhysMemory,
    table: &PageTable,
    va: usize,
    pa: usize,
    size: usize,
    perm: PageFlags,
) -> Result<(), MapError> {
    let mut off = 0;
    while off < size {
        table.map(phys, va + off, pa + off, perm)?;
        off += PAGE_SIZE;
    }
    Ok(())
}

/// Builds the kernel's address space: everything below the process
/// region identity-mapped kernel-only, except the console frame, which
/// stays user-writable so processes can print.
pub fn kernel_address_space(phys: &mut PhysMemory) -> Result<PageTable, MapError> {
    let table = PageTable::new(phys, PageOwner::Kernel).ok_or(MapError::Exhausted)?;
    map_range(
        phys,
        &table,
        0,
        0,
        PROC_START_ADDR,
        PageFlags::PRESENT | PageFlags::WRITABLE,
    )?;
    table.map(phys, CONSOLE_ADDR, CONSOLE_ADDR, PageFlags::FULL)?;
    Ok(table)
}

/// Clones `source` into a fresh tree owned by `new_owner`: every mapped
/// page of the full virtual range is re-mapped at the same physical
/// address with the same permissions. No data pages are copied and no
/// reference counts change; callers decide per page whether to share or
/// duplicate afterwards.
///
/// On node exhaustion returns `None` and leaves the partial tree in the
/// arena, attributed to `new_owner`, for the caller to sweep away.
pub fn copy_pagetable(
    phys: &mut PhysMemory,
    source: &PageTable,
    new_owner: Pid,
) -> Option<PageTable> {
    let table = PageTable::new(phys, PageOwner::Process(new_owner))?;
    let mut va = 0;
    while va < MEMSIZE_VIRTUAL {
        if let Some(m) = source.lookup(phys, va) {
            if table.map(phys, va, m.pa, m.perm).is_err() {
                return None;
            }
        }
        va += PAGE_SIZE;
    }
    Some(table)
}
