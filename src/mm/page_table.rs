// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Four-level page tables stored inside the frame arena.
//!
//! A table node is an ordinary frame whose 4 KiB hold 512 little-endian
//! 64-bit entries: the child's physical address with permission bits in
//! the low twelve. `PageTable` itself is only a handle on the root frame;
//! all node storage lives in [`PhysMemory`], so allocating a node charges
//! the same arena as allocating process memory.

use crate::mm::phys::{PageOwner, PhysMemory};
use crate::mm::{
    page_address, page_number, MapError, PageFlags, MEMSIZE_PHYSICAL, MEMSIZE_VIRTUAL,
    NPAGETABLE_ENTRIES, PAGE_SIZE,
};

const ENTRY_BYTES: usize = 8;
const LEVELS: usize = 4;

/// Index of `va` into a node at the given level (0 = root, 3 = leaf).
pub(crate) fn entry_index(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * (LEVELS - 1 - level))) & (NPAGETABLE_ENTRIES - 1)
}

pub(crate) fn read_entry(phys: &PhysMemory, node: usize, index: usize) -> u64 {
    let off = index * ENTRY_BYTES;
    let mut word = [0u8; ENTRY_BYTES];
    word.copy_from_slice(&phys.page_bytes(node)[off..off + ENTRY_BYTES]);
    u64::from_le_bytes(word)
}

fn write_entry(phys: &mut PhysMemory, node: usize, index: usize, entry: u64) {
    let off = index * ENTRY_BYTES;
    phys.page_bytes_mut(node)[off..off + ENTRY_BYTES].copy_from_slice(&entry.to_le_bytes());
}

/// Frame number a present entry points at.
pub(crate) fn entry_target(entry: u64) -> usize {
    page_number((entry & !(PAGE_SIZE as u64 - 1)) as usize)
}

pub(crate) fn entry_flags(entry: u64) -> PageFlags {
    PageFlags::from_bits_truncate(entry)
}

/// One resolved leaf mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Frame number of the mapped frame.
    pub pn: usize,
    /// Physical address of the mapped frame.
    pub pa: usize,
    /// Leaf permission bits.
    pub perm: PageFlags,
}

/// Handle on one address space's root node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTable {
    root: usize,
}

impl PageTable {
    /// Allocates a zeroed root charged to `owner`.
    pub fn new(phys: &mut PhysMemory, owner: PageOwner) -> Option<Self> {
        let root = phys.find_free_page(owner)?;
        Some(PageTable { root })
    }

    #[must_use]
    pub fn root(&self) -> usize {
        self.root
    }

    /// Points `va` at `pa` with permission `perm`, creating intermediate
    /// nodes on demand. New nodes are charged to whoever owns the root.
    ///
    /// An existing leaf entry is overwritten without releasing the old
    /// target; the caller owns that bookkeeping. `perm` may be empty,
    /// which records the translation while leaving it inaccessible.
    pub fn map(
        &self,
        phys: &mut PhysMemory,
        va: usize,
        pa: usize,
        perm: PageFlags,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if va >= MEMSIZE_VIRTUAL || pa >= MEMSIZE_PHYSICAL {
            return Err(MapError::OutOfRange);
        }
        let owner = phys.owner(self.root);
        let mut node = self.root;
        for level in 0..LEVELS - 1 {
            let index = entry_index(va, level);
            let entry = read_entry(phys, node, index);
            if entry_flags(entry).contains(PageFlags::PRESENT) {
                node = entry_target(entry);
            } else {
                let child = phys.find_free_page(owner).ok_or(MapError::Exhausted)?;
                let entry = page_address(child) as u64 | PageFlags::FULL.bits();
                write_entry(phys, node, index, entry);
                node = child;
            }
        }
        let leaf = pa as u64 | perm.bits();
        write_entry(phys, node, entry_index(va, LEVELS - 1), leaf);
        Ok(())
    }

    /// Resolves `va`, requiring the present bit at every level and at the
    /// leaf. Pure: never allocates.
    #[must_use]
    pub fn lookup(&self, phys: &PhysMemory, va: usize) -> Option<Mapping> {
        if va >= MEMSIZE_VIRTUAL {
            return None;
        }
        let mut node = self.root;
        for level in 0..LEVELS - 1 {
            let entry = read_entry(phys, node, entry_index(va, level));
            if !entry_flags(entry).contains(PageFlags::PRESENT) {
                return None;
            }
            node = entry_target(entry);
        }
        let entry = read_entry(phys, node, entry_index(va, LEVELS - 1));
        let perm = entry_flags(entry);
        if !perm.contains(PageFlags::PRESENT) {
            return None;
        }
        let pn = entry_target(entry);
        Some(Mapping {
            pn,
            pa: page_address(pn),
            perm,
        })
    }
}
