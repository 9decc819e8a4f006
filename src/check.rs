// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-state audits cross-checking the frame arena against every live address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: audit, Violation
//! DEPENDS_ON: kernel::Kernel, mm::{PhysMemory,PageTable}, task
//! INVARIANTS: Read-only over kernel state; reports the first inconsistency; debug builds run it after every trap so a bookkeeping bug halts at the trap that introduced it

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::kernel::Kernel;
use crate::mm::page_table::{entry_flags, entry_target, read_entry, PageTable};
use crate::mm::phys::{PageOwner, PhysMemory};
use crate::mm::{
    page_number, PageFlags, CONSOLE_ADDR, MEMSIZE_VIRTUAL, NPAGES, PAGE_SIZE, PROC_START_ADDR,
};
use crate::task::ProcessState;
use crate::types::Pid;

/// First inconsistency an audit found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// Slot 0 has state or an address space.
    ReservedSlotActive,
    /// Frame attributed to a pid whose slot is free.
    DeadOwner { pn: usize },
    /// Page-table node not owned by its space, or shared.
    NodeOwnership { pn: usize },
    /// A live mapping references an unreferenced frame.
    ZeroRefcountMapping { pid: Pid, va: usize },
    /// Frame refcount disagrees with the number of mappings of it.
    RefcountSkew {
        pn: usize,
        refcount: u16,
        mappings: u16,
    },
    /// User-writable mapping below the process region (console aside).
    UserWritableKernelRange { pid: Pid, va: usize },
    /// Kernel space no longer identity-maps its own region.
    IdentityBroken { va: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::ReservedSlotActive => write!(f, "reserved process slot is active"),
            Violation::DeadOwner { pn } => {
                write!(f, "frame {pn} owned by a free process slot")
            }
            Violation::NodeOwnership { pn } => {
                write!(f, "page-table node {pn} has wrong owner or refcount")
            }
            Violation::ZeroRefcountMapping { pid, va } => {
                write!(f, "{pid} maps {va:#x} to an unreferenced frame")
            }
            Violation::RefcountSkew {
                pn,
                refcount,
                mappings,
            } => write!(
                f,
                "frame {pn} refcount {refcount} but {mappings} mappings"
            ),
            Violation::UserWritableKernelRange { pid, va } => {
                write!(f, "{pid} maps {va:#x} user-writable below the process region")
            }
            Violation::IdentityBroken { va } => {
                write!(f, "kernel space does not identity-map {va:#x}")
            }
        }
    }
}

/// Gathers the frame numbers of every node in `table`'s tree,
/// root included.
fn collect_nodes(phys: &PhysMemory, table: &PageTable) -> Vec<usize> {
    let mut nodes = vec![table.root()];
    let mut frontier = vec![(table.root(), 0usize)];
    while let Some((node, level)) = frontier.pop() {
        if level == 3 {
            continue;
        }
        for index in 0..crate::mm::NPAGETABLE_ENTRIES {
            let entry = read_entry(phys, node, index);
            if entry_flags(entry).contains(PageFlags::PRESENT) {
                let child = entry_target(entry);
                nodes.push(child);
                frontier.push((child, level + 1));
            }
        }
    }
    nodes
}

fn check_space_nodes(
    phys: &PhysMemory,
    table: &PageTable,
    owner: PageOwner,
    is_node: &mut [bool],
) -> Result<(), Violation> {
    for pn in collect_nodes(phys, table) {
        if phys.owner(pn) != owner || phys.refcount(pn) != 1 {
            return Err(Violation::NodeOwnership { pn });
        }
        is_node[pn] = true;
    }
    Ok(())
}

/// Audits the whole kernel state; `Err` carries the first violation.
pub fn audit(kernel: &Kernel) -> Result<(), Violation> {
    let phys = &kernel.phys;
    let procs = &kernel.processes;

    if let Some(zero) = procs.get(Pid::RESERVED) {
        if zero.state() != ProcessState::Free || zero.page_table().is_some() {
            return Err(Violation::ReservedSlotActive);
        }
    }

    // Every frame attributed to a process must have a live owner.
    for pn in 0..NPAGES {
        if let PageOwner::Process(p) = phys.owner(pn) {
            if procs.state(p) == ProcessState::Free {
                return Err(Violation::DeadOwner { pn });
            }
        }
    }

    // Table nodes belong to their space, unshared.
    let mut is_node = vec![false; NPAGES];
    check_space_nodes(phys, &kernel.kernel_space, PageOwner::Kernel, &mut is_node)?;
    let mut live = Vec::new();
    for index in 1..crate::task::NPROC {
        let pid = Pid::from_raw(index as u32);
        let Some(p) = procs.get(pid) else { continue };
        if p.state() == ProcessState::Free {
            continue;
        }
        let Some(table) = p.page_table() else { continue };
        check_space_nodes(phys, table, PageOwner::Process(pid), &mut is_node)?;
        live.push((pid, *table));
    }

    // Count leaf mappings of the process region across all live spaces.
    let mut mappings = vec![0u16; NPAGES];
    for &(pid, table) in &live {
        let mut va = PROC_START_ADDR;
        while va < MEMSIZE_VIRTUAL {
            if let Some(m) = table.lookup(phys, va) {
                if phys.refcount(m.pn) == 0 {
                    return Err(Violation::ZeroRefcountMapping { pid, va });
                }
                mappings[m.pn] += 1;
            }
            va += PAGE_SIZE;
        }
    }
    for pn in 0..NPAGES {
        if is_node[pn] {
            continue;
        }
        let skew = match phys.owner(pn) {
            PageOwner::Process(_) => phys.refcount(pn) != mappings[pn],
            // Early-reclaimed frames: unowned but still referenced.
            PageOwner::Free => phys.refcount(pn) != 0 && phys.refcount(pn) != mappings[pn],
            // Kernel and reserved frames are identity-shared below the
            // process region and never counted per mapping.
            PageOwner::Kernel | PageOwner::Reserved => false,
        };
        if skew {
            return Err(Violation::RefcountSkew {
                pn,
                refcount: phys.refcount(pn),
                mappings: mappings[pn],
            });
        }
    }

    // Nothing user-writable below the process region except the console.
    let user_writable = PageFlags::USER | PageFlags::WRITABLE;
    for &(pid, table) in &live {
        let mut va = 0;
        while va < PROC_START_ADDR {
            if let Some(m) = table.lookup(phys, va) {
                if m.perm.contains(user_writable) && page_number(va) != page_number(CONSOLE_ADDR) {
                    return Err(Violation::UserWritableKernelRange { pid, va });
                }
            }
            va += PAGE_SIZE;
        }
    }

    // The kernel's own space still identity-maps the low region.
    let mut va = 0;
    while va < PROC_START_ADDR {
        match kernel.kernel_space.lookup(phys, va) {
            Some(m) if m.pa == va => {}
            _ => return Err(Violation::IdentityBroken { va }),
        }
        va += PAGE_SIZE;
    }

    Ok(())
}
