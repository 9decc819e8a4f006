// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory management: layout constants, the frame arena and page tables.
//!
//! The machine owns 2 MiB of physical memory and gives each process a
//! 3 MiB virtual space. The kernel occupies a fixed low region and is
//! identity-mapped in every address space; process-private memory starts
//! at [`PROC_START_ADDR`].

pub mod address_space;
pub mod page_table;
pub mod phys;

#[cfg(test)]
mod tests_prop;

pub use address_space::{copy_pagetable, kernel_address_space, map_range};
pub use page_table::{Mapping, PageTable};
pub use phys::{PageOwner, PhysError, PhysMemory};

use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Frame and page granule.
pub const PAGE_SIZE: usize = 4096;
/// Entries per page-table node.
pub const NPAGETABLE_ENTRIES: usize = 512;
/// First byte of kernel code and data.
pub const KERNEL_START_ADDR: usize = 0x40000;
/// Top of the kernel stack; the stack grows down from here.
pub const KERNEL_STACK_TOP: usize = 0x80000;
/// Memory-mapped console buffer, user-writable by design.
pub const CONSOLE_ADDR: usize = 0xB8000;
/// First virtual address processes may own memory at.
pub const PROC_START_ADDR: usize = 0x100000;
/// Bytes of physical memory.
pub const MEMSIZE_PHYSICAL: usize = 0x200000;
/// Bytes of virtual space per process.
pub const MEMSIZE_VIRTUAL: usize = 0x300000;
/// Frames in the arena.
pub const NPAGES: usize = MEMSIZE_PHYSICAL / PAGE_SIZE;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert_eq!(NPAGETABLE_ENTRIES * 8, PAGE_SIZE);
const_assert!(KERNEL_START_ADDR < KERNEL_STACK_TOP);
const_assert!(KERNEL_STACK_TOP <= CONSOLE_ADDR);
const_assert!(CONSOLE_ADDR < PROC_START_ADDR);
const_assert!(PROC_START_ADDR < MEMSIZE_PHYSICAL);
const_assert!(MEMSIZE_PHYSICAL < MEMSIZE_VIRTUAL);
const_assert_eq!(MEMSIZE_VIRTUAL % PAGE_SIZE, 0);

/// Frame number of the physical address containing `addr`.
#[must_use]
pub const fn page_number(addr: usize) -> usize {
    addr / PAGE_SIZE
}

/// First byte of frame `pn`.
#[must_use]
pub const fn page_address(pn: usize) -> usize {
    pn * PAGE_SIZE
}

bitflags! {
    /// Leaf permission bits; intermediate nodes always carry all three.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PageFlags {
    /// Present, writable, user: the permission of a freshly allocated
    /// process page and of every intermediate node.
    pub const FULL: PageFlags = PageFlags::PRESENT
        .union(PageFlags::WRITABLE)
        .union(PageFlags::USER);
}

/// Why a mapping request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum MapError {
    /// Virtual or physical address not page-aligned.
    Unaligned,
    /// Address beyond the virtual or physical limit.
    OutOfRange,
    /// No free frame for an intermediate node.
    Exhausted,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Unaligned => write!(f, "address not page-aligned"),
            MapError::OutOfRange => write!(f, "address out of range"),
            MapError::Exhausted => write!(f, "out of physical memory"),
        }
    }
}
