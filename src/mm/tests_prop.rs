// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property tests for the frame arena and page tables.
//!
//! TEST_SCOPE: randomized sequences of arena and mapping operations,
//! checking the bookkeeping laws that the point tests only probe at
//! hand-picked spots: ownership implies a live refcount, the last map
//! of an address wins, and a table copy translates exactly like its
//! source.

use proptest::prelude::*;

use crate::mm::phys::{default_reserved, PageOwner, PhysMemory};
use crate::mm::{
    copy_pagetable, page_address, PageFlags, PageTable, KERNEL_START_ADDR, MEMSIZE_VIRTUAL,
    NPAGES, PAGE_SIZE, PROC_START_ADDR,
};
use crate::types::Pid;

fn arena() -> PhysMemory {
    PhysMemory::init(KERNEL_START_ADDR + PAGE_SIZE, default_reserved)
}

#[derive(Clone, Debug)]
enum ArenaOp {
    Alloc { pid: u32 },
    Release { pn_seed: usize, pid: u32 },
    Retain { pn_seed: usize },
}

fn arena_op() -> impl Strategy<Value = ArenaOp> {
    prop_oneof![
        (1u32..8).prop_map(|pid| ArenaOp::Alloc { pid }),
        ((0usize..NPAGES), (1u32..8)).prop_map(|(pn_seed, pid)| ArenaOp::Release { pn_seed, pid }),
        (0usize..NPAGES).prop_map(|pn_seed| ArenaOp::Retain { pn_seed }),
    ]
}

/// Picks a frame the op can legally touch, if any.
fn pick_referenced(phys: &PhysMemory, seed: usize) -> Option<usize> {
    (0..NPAGES)
        .map(|i| (seed + i) % NPAGES)
        .find(|&pn| phys.refcount(pn) > 0 && matches!(phys.owner(pn), PageOwner::Process(_) | PageOwner::Free))
}

proptest! {
    /// Process ownership always comes with at least one reference, and
    /// an allocation never hands out a frame somebody still references.
    #[test]
    fn ownership_implies_reference(ops in proptest::collection::vec(arena_op(), 1..200)) {
        let mut phys = arena();
        for op in ops {
            match op {
                ArenaOp::Alloc { pid } => {
                    if let Some(pn) = phys.find_free_page(PageOwner::Process(Pid::from_raw(pid))) {
                        prop_assert_eq!(phys.refcount(pn), 1);
                    }
                }
                ArenaOp::Release { pn_seed, pid } => {
                    if let Some(pn) = pick_referenced(&phys, pn_seed) {
                        phys.release_page(pn, Pid::from_raw(pid));
                    }
                }
                ArenaOp::Retain { pn_seed } => {
                    if let Some(pn) = pick_referenced(&phys, pn_seed) {
                        phys.retain_page(pn);
                    }
                }
            }
        }
        for pn in 0..NPAGES {
            if matches!(phys.owner(pn), PageOwner::Process(_)) {
                prop_assert!(phys.refcount(pn) > 0, "owned frame {} unreferenced", pn);
            }
        }
    }

    /// For any sequence of maps, lookup returns the LAST mapping of each
    /// address and nothing for addresses never mapped.
    #[test]
    fn last_map_wins(
        maps in proptest::collection::vec(
            (0usize..MEMSIZE_VIRTUAL / PAGE_SIZE, 0usize..NPAGES, 0u64..8),
            1..64,
        )
    ) {
        let mut phys = arena();
        let table = PageTable::new(&mut phys, PageOwner::Kernel).unwrap();
        let mut expected: alloc::collections::BTreeMap<usize, (usize, PageFlags)> =
            alloc::collections::BTreeMap::new();
        for (va_pn, pa_pn, bits) in maps {
            let va = va_pn * PAGE_SIZE;
            let pa = page_address(pa_pn);
            let perm = PageFlags::from_bits_truncate(bits);
            table.map(&mut phys, va, pa, perm).unwrap();
            if perm.contains(PageFlags::PRESENT) {
                expected.insert(va, (pa, perm));
            } else {
                expected.remove(&va);
            }
        }
        for (va, (pa, perm)) in &expected {
            let m = table.lookup(&phys, *va);
            prop_assert!(m.is_some(), "lost mapping at {:#x}", va);
            let m = m.unwrap();
            prop_assert_eq!(m.pa, *pa);
            prop_assert_eq!(m.perm, *perm);
        }
        // A probe outside the mapped set resolves to nothing.
        for probe in (0..MEMSIZE_VIRTUAL).step_by(16 * PAGE_SIZE) {
            if !expected.contains_key(&probe) {
                let m = table.lookup(&phys, probe);
                prop_assert!(
                    m.is_none() || !m.unwrap().perm.contains(PageFlags::PRESENT),
                    "phantom mapping at {:#x}", probe
                );
            }
        }
    }

    /// A copied table translates every address exactly like its source.
    #[test]
    fn copy_is_translation_equivalent(
        maps in proptest::collection::vec(
            (PROC_START_ADDR / PAGE_SIZE..MEMSIZE_VIRTUAL / PAGE_SIZE, 0usize..NPAGES),
            1..32,
        )
    ) {
        let mut phys = arena();
        let source = PageTable::new(&mut phys, PageOwner::Kernel).unwrap();
        for (va_pn, pa_pn) in maps {
            source
                .map(&mut phys, va_pn * PAGE_SIZE, page_address(pa_pn), PageFlags::FULL)
                .unwrap();
        }
        let pid = Pid::from_raw(3);
        let copy = copy_pagetable(&mut phys, &source, pid).unwrap();
        for va in (0..MEMSIZE_VIRTUAL).step_by(PAGE_SIZE) {
            prop_assert_eq!(copy.lookup(&phys, va), source.lookup(&phys, va));
        }
    }
}
