// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and lifecycle helpers for the SYNAPSE kernel
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcessTable (setup/fork/cleanup/cleanup_partial), Process, ProcessState, SetupError, NPROC
//! DEPENDS_ON: loader, mm::{PhysMemory,PageTable}, trap::Registers, types::Pid
//! INVARIANTS: Slot 0 reserved; frames attributed before they are mapped; every failed build tears its slot back down

use alloc::vec::Vec;
use core::fmt;

use crate::loader::{self, LoaderError, Program};
use crate::mm::phys::{PageOwner, PhysMemory};
use crate::mm::{
    copy_pagetable, map_range, page_address, MapError, PageFlags, PageTable, MEMSIZE_PHYSICAL,
    MEMSIZE_VIRTUAL, NPAGES, PAGE_SIZE, PROC_START_ADDR,
};
use crate::trap::Registers;
use crate::types::Pid;

/// Process table slots, including the reserved slot 0.
pub const NPROC: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot unused.
    Free,
    /// Eligible for scheduling.
    Runnable,
    /// Faulted; keeps its memory but never runs again.
    Broken,
}

/// One process: scheduling state, saved registers and its address space.
pub struct Process {
    pid: Pid,
    state: ProcessState,
    registers: Registers,
    page_table: Option<PageTable>,
}

impl Process {
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub(crate) fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    #[must_use]
    pub fn page_table(&self) -> Option<&PageTable> {
        self.page_table.as_ref()
    }
}

/// Why a process could not be set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum SetupError {
    /// Slot 0 never hosts a process.
    ReservedPid,
    /// Pid outside the table or slot already occupied.
    SlotBusy,
    /// Not enough frames for the address space or stack.
    OutOfMemory,
    Loader(LoaderError),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::ReservedPid => write!(f, "slot 0 is reserved"),
            SetupError::SlotBusy => write!(f, "process slot unavailable"),
            SetupError::OutOfMemory => write!(f, "out of physical memory"),
            SetupError::Loader(e) => write!(f, "program load failed: {e}"),
        }
    }
}

impl From<LoaderError> for SetupError {
    fn from(e: LoaderError) -> Self {
        SetupError::Loader(e)
    }
}

impl From<MapError> for SetupError {
    fn from(_: MapError) -> Self {
        // The only map failure reachable from setup is node exhaustion;
        // alignment and range are fixed by construction.
        SetupError::OutOfMemory
    }
}

/// All process slots. Pid `n` lives at index `n`.
pub struct ProcessTable {
    slots: Vec<Process>,
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NPROC);
        for index in 0..NPROC {
            slots.push(Process {
                pid: Pid::from_raw(index as u32),
                state: ProcessState::Free,
                registers: Registers::default(),
                page_table: None,
            });
        }
        ProcessTable { slots }
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_index())
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_index())
    }

    /// State of `pid`'s slot; `Free` for out-of-table pids.
    #[must_use]
    pub fn state(&self, pid: Pid) -> ProcessState {
        self.get(pid).map_or(ProcessState::Free, Process::state)
    }

    /// Lowest free slot above the reserved one.
    #[must_use]
    pub fn find_free_slot(&self) -> Option<Pid> {
        self.slots[1..]
            .iter()
            .find(|p| p.state == ProcessState::Free)
            .map(|p| p.pid)
    }

    #[must_use]
    pub fn runnable(&self) -> usize {
        self.slots
            .iter()
            .filter(|p| p.state == ProcessState::Runnable)
            .count()
    }

    /// Hands an address space to a slot without changing its state.
    pub(crate) fn adopt(&mut self, pid: Pid, table: PageTable) {
        if let Some(p) = self.get_mut(pid) {
            p.page_table = Some(table);
        }
    }

    /// Builds a fresh process in slot `pid` from `program`.
    ///
    /// The address space starts as a copy of the kernel's, the whole
    /// process region is pre-reserved with empty permissions so later
    /// allocations fault rather than alias physical memory, segments are
    /// loaded, and one stack page is claimed from the top of physical
    /// memory and mapped at the top of the virtual space. Any failure
    /// tears the slot back down before returning.
    pub fn setup(
        &mut self,
        phys: &mut PhysMemory,
        kernel_space: &PageTable,
        pid: Pid,
        program: &Program,
    ) -> Result<(), SetupError> {
        if pid == Pid::RESERVED {
            return Err(SetupError::ReservedPid);
        }
        if pid.as_index() >= NPROC || self.state(pid) != ProcessState::Free {
            return Err(SetupError::SlotBusy);
        }

        let Some(table) = copy_pagetable(phys, kernel_space, pid) else {
            self.cleanup_partial(phys, pid, PROC_START_ADDR);
            return Err(SetupError::OutOfMemory);
        };
        self.adopt(pid, table);

        let result = self.populate(phys, &table, pid, program);
        if result.is_err() {
            self.cleanup(phys, pid);
        }
        result
    }

    fn populate(
        &mut self,
        phys: &mut PhysMemory,
        table: &PageTable,
        pid: Pid,
        program: &Program,
    ) -> Result<(), SetupError> {
        map_range(
            phys,
            table,
            PROC_START_ADDR,
            PROC_START_ADDR,
            MEMSIZE_PHYSICAL - PROC_START_ADDR,
            PageFlags::empty(),
        )?;
        loader::load(phys, table, pid, program)?;

        // Claim the stack frame from the top of physical memory so user
        // stacks stay clear of the low-address allocation stream.
        let stack_pn = (0..NPAGES)
            .rev()
            .find(|&pn| phys.refcount(pn) == 0)
            .ok_or(SetupError::OutOfMemory)?;
        phys.assign_physical_page(page_address(stack_pn), PageOwner::Process(pid))
            .map_err(|_| SetupError::OutOfMemory)?;
        let stack_va = MEMSIZE_VIRTUAL - PAGE_SIZE;
        table.map(phys, stack_va, page_address(stack_pn), PageFlags::FULL)?;

        let slot = self.get_mut(pid).ok_or(SetupError::SlotBusy)?;
        slot.registers = Registers {
            pc: program.entry,
            sp: MEMSIZE_VIRTUAL,
            ..Registers::default()
        };
        slot.state = ProcessState::Runnable;
        Ok(())
    }

    /// Duplicates `parent` into the lowest free slot.
    ///
    /// The child gets a copy of the parent's address space, shares
    /// read-only user pages by reference count and receives eager
    /// byte-for-byte copies of writable user pages. Registers are
    /// copied with the return value cleared. On any allocation failure
    /// the half-built child is torn down and `None` is returned.
    pub fn fork(&mut self, phys: &mut PhysMemory, parent: Pid) -> Option<Pid> {
        let parent_table = *self.get(parent)?.page_table()?;
        let child = self.find_free_slot()?;
        let Some(child_table) = copy_pagetable(phys, &parent_table, child) else {
            // The partial tree is attributed to the child; sweep it away.
            self.cleanup_partial(phys, child, PROC_START_ADDR);
            return None;
        };
        self.adopt(child, child_table);

        let mut va = PROC_START_ADDR;
        while va < MEMSIZE_VIRTUAL {
            if let Some(m) = parent_table.lookup(phys, va) {
                if m.perm.contains(PageFlags::USER) {
                    if m.perm.contains(PageFlags::WRITABLE) {
                        let Some(pn) = phys.find_free_page(PageOwner::Process(child)) else {
                            self.cleanup_partial(phys, child, va);
                            return None;
                        };
                        phys.copy_page(pn, m.pn);
                        if child_table.map(phys, va, page_address(pn), m.perm).is_err() {
                            self.cleanup_partial(phys, child, va);
                            return None;
                        }
                    } else {
                        phys.retain_page(m.pn);
                    }
                }
            }
            va += PAGE_SIZE;
        }

        let parent_regs = *self.get(parent)?.registers();
        let slot = self.get_mut(child)?;
        slot.registers = parent_regs;
        slot.registers.ret = 0;
        slot.state = ProcessState::Runnable;
        Some(child)
    }

    /// Releases everything `pid` holds and frees the slot.
    pub fn cleanup(&mut self, phys: &mut PhysMemory, pid: Pid) {
        self.cleanup_partial(phys, pid, MEMSIZE_VIRTUAL);
    }

    /// Tears down a partially built process: releases every page its
    /// table maps in the process region below `va_bound`, releases the
    /// table, then sweeps the arena for any frame still attributed to
    /// `pid` (pages a failed build claimed but never got mapped).
    pub(crate) fn cleanup_partial(&mut self, phys: &mut PhysMemory, pid: Pid, va_bound: usize) {
        let Some(slot) = self.slots.get_mut(pid.as_index()) else {
            return;
        };
        if let Some(table) = slot.page_table.take() {
            let mut va = PROC_START_ADDR;
            while va < va_bound && va < MEMSIZE_VIRTUAL {
                if let Some(m) = table.lookup(phys, va) {
                    phys.release_page(m.pn, pid);
                }
                va += PAGE_SIZE;
            }
            phys.release_page(table.root(), pid);
        }
        slot.state = ProcessState::Free;
        slot.registers = Registers::default();
        for pn in 0..NPAGES {
            if phys.owner(pn) == PageOwner::Process(pid) {
                phys.release_page(pn, pid);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_runnable_for_test(&mut self, pid: Pid) {
        if let Some(p) = self.get_mut(pid) {
            p.state = ProcessState::Runnable;
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        ProcessTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Segment;
    use crate::mm::phys::default_reserved;
    use crate::mm::{kernel_address_space, KERNEL_START_ADDR};

    fn boot() -> (PhysMemory, PageTable, ProcessTable) {
        let mut phys = PhysMemory::init(KERNEL_START_ADDR + PAGE_SIZE, default_reserved);
        let kernel = kernel_address_space(&mut phys).unwrap();
        (phys, kernel, ProcessTable::new())
    }

    fn program() -> Program {
        Program {
            entry: PROC_START_ADDR,
            segments: alloc::vec![
                Segment {
                    va: PROC_START_ADDR,
                    data: alloc::vec![0x90; 64],
                    writable: false,
                },
                Segment {
                    va: PROC_START_ADDR + PAGE_SIZE,
                    data: alloc::vec![0; 32],
                    writable: true,
                },
            ],
        }
    }

    #[test]
    fn setup_builds_a_runnable_process() {
        let (mut phys, kernel, mut table) = boot();
        let pid = Pid::from_raw(1);
        table.setup(&mut phys, &kernel, pid, &program()).unwrap();

        let p = table.get(pid).unwrap();
        assert_eq!(p.state(), ProcessState::Runnable);
        assert_eq!(p.registers().pc, PROC_START_ADDR);
        assert_eq!(p.registers().sp, MEMSIZE_VIRTUAL);

        let space = p.page_table().unwrap();
        // Code is user-visible, read-only.
        let code = space.lookup(&phys, PROC_START_ADDR).unwrap();
        assert_eq!(code.perm, PageFlags::PRESENT | PageFlags::USER);
        // Stack page sits at the top of both spaces.
        let stack = space.lookup(&phys, MEMSIZE_VIRTUAL - PAGE_SIZE).unwrap();
        assert_eq!(stack.perm, PageFlags::FULL);
        assert_eq!(stack.pn, NPAGES - 1);
        assert_eq!(phys.owner(stack.pn), PageOwner::Process(pid));
        // Kernel region is mapped but not user-accessible.
        let kernel_page = space.lookup(&phys, KERNEL_START_ADDR).unwrap();
        assert!(!kernel_page.perm.contains(PageFlags::USER));
    }

    #[test]
    fn second_process_stacks_below_the_first() {
        let (mut phys, kernel, mut table) = boot();
        table.setup(&mut phys, &kernel, Pid::from_raw(1), &program()).unwrap();
        table.setup(&mut phys, &kernel, Pid::from_raw(2), &program()).unwrap();
        let second = table.get(Pid::from_raw(2)).unwrap();
        let stack = second
            .page_table()
            .unwrap()
            .lookup(&phys, MEMSIZE_VIRTUAL - PAGE_SIZE)
            .unwrap();
        assert_eq!(stack.pn, NPAGES - 2);
    }

    #[test]
    fn setup_rejects_reserved_and_busy_slots() {
        let (mut phys, kernel, mut table) = boot();
        assert_eq!(
            table.setup(&mut phys, &kernel, Pid::RESERVED, &program()),
            Err(SetupError::ReservedPid)
        );
        let pid = Pid::from_raw(1);
        table.setup(&mut phys, &kernel, pid, &program()).unwrap();
        assert_eq!(
            table.setup(&mut phys, &kernel, pid, &program()),
            Err(SetupError::SlotBusy)
        );
        assert_eq!(
            table.setup(&mut phys, &kernel, Pid::from_raw(NPROC as u32), &program()),
            Err(SetupError::SlotBusy)
        );
    }

    #[test]
    fn cleanup_returns_every_frame() {
        let (mut phys, kernel, mut table) = boot();
        let free_before = phys.free_frames();
        let pid = Pid::from_raw(1);
        table.setup(&mut phys, &kernel, pid, &program()).unwrap();
        assert!(phys.free_frames() < free_before);

        table.cleanup(&mut phys, pid);
        assert_eq!(table.state(pid), ProcessState::Free);
        assert!(table.get(pid).unwrap().page_table().is_none());
        assert_eq!(phys.free_frames(), free_before);
        assert!((0..NPAGES).all(|pn| phys.owner(pn) != PageOwner::Process(pid)));
    }

    #[test]
    fn failed_setup_leaks_nothing() {
        let (mut phys, kernel, mut table) = boot();
        // Exhaust the arena down to too few frames for a table copy.
        let hog = Pid::from_raw(9);
        while phys.free_frames() > 2 {
            phys.find_free_page(PageOwner::Process(hog)).unwrap();
        }
        let free_before = phys.free_frames();
        let pid = Pid::from_raw(1);
        assert_eq!(
            table.setup(&mut phys, &kernel, pid, &program()),
            Err(SetupError::OutOfMemory)
        );
        assert_eq!(table.state(pid), ProcessState::Free);
        assert_eq!(phys.free_frames(), free_before);
    }

    #[test]
    fn shared_frames_survive_owner_cleanup() {
        let (mut phys, kernel, mut table) = boot();
        let pid = Pid::from_raw(1);
        table.setup(&mut phys, &kernel, pid, &program()).unwrap();
        let code_pn = table
            .get(pid)
            .unwrap()
            .page_table()
            .unwrap()
            .lookup(&phys, PROC_START_ADDR)
            .unwrap()
            .pn;
        phys.retain_page(code_pn);

        table.cleanup(&mut phys, pid);
        // The other reference keeps the frame unallocatable.
        assert_eq!(phys.owner(code_pn), PageOwner::Free);
        assert_eq!(phys.refcount(code_pn), 1);
        assert_ne!(
            phys.find_free_page(PageOwner::Process(Pid::from_raw(2))),
            Some(code_pn)
        );
    }

    #[test]
    fn fork_clones_into_the_next_slot() {
        let (mut phys, kernel, mut table) = boot();
        let parent = Pid::from_raw(1);
        table.setup(&mut phys, &kernel, parent, &program()).unwrap();
        let child = table.fork(&mut phys, parent).unwrap();
        assert_eq!(child, Pid::from_raw(2));
        assert_eq!(table.state(child), ProcessState::Runnable);
        assert_eq!(table.get(child).unwrap().registers().ret, 0);
        assert_eq!(
            table.get(child).unwrap().registers().pc,
            table.get(parent).unwrap().registers().pc
        );
        // The read-only code page is shared, not copied.
        let code = table
            .get(parent)
            .unwrap()
            .page_table()
            .unwrap()
            .lookup(&phys, PROC_START_ADDR)
            .unwrap();
        assert_eq!(phys.refcount(code.pn), 2);
    }

    #[test]
    fn free_slot_scan_skips_slot_zero() {
        let (mut phys, kernel, mut table) = boot();
        assert_eq!(table.find_free_slot(), Some(Pid::from_raw(1)));
        table.setup(&mut phys, &kernel, Pid::from_raw(1), &program()).unwrap();
        assert_eq!(table.find_free_slot(), Some(Pid::from_raw(2)));
    }
}
