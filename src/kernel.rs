// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The kernel context and the outer run loop.
//!
//! All kernel state lives in one [`Kernel`] value: the frame arena, the
//! kernel address space, the process table and the scheduler. The
//! embedder owns the CPU: [`Kernel::run`] hands it a pid and saved
//! registers, the embedder executes user code until the next trap and
//! returns the decoded event. The loop ends only by halting or when the
//! abort signal fires while nothing is runnable.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::loader::Program;
use crate::log_info;
use crate::mm::phys::{default_reserved, PhysMemory};
use crate::mm::{kernel_address_space, PageTable, KERNEL_STACK_TOP, KERNEL_START_ADDR};
use crate::sched::Scheduler;
use crate::task::{ProcessTable, SetupError};
use crate::trap::{self, HaltReason, Registers, Resumption, Trap};
use crate::types::Pid;

/// Timer interrupt rate the embedder is expected to program, in Hz.
pub const HZ: u32 = 100;

/// Why boot was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum BootError {
    /// The kernel image end lies outside the kernel region.
    BadKernelSpan,
    /// Not enough frames for the kernel address space.
    OutOfMemory,
}

/// Cross-thread shutdown request, polled while idle.
pub struct AbortSignal(AtomicBool);

impl AbortSignal {
    #[must_use]
    pub const fn new() -> Self {
        AbortSignal(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        AbortSignal::new()
    }
}

/// The whole machine-independent kernel state.
pub struct Kernel {
    pub(crate) phys: PhysMemory,
    pub(crate) kernel_space: PageTable,
    pub(crate) processes: ProcessTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) ticks: u64,
}

impl Kernel {
    /// Boots with the default firmware-reserved regions.
    pub fn boot(kernel_end: usize) -> Result<Self, BootError> {
        Kernel::boot_with_reserved(kernel_end, default_reserved)
    }

    /// Seeds the arena, builds the kernel address space and an empty
    /// process table. `kernel_end` is the first byte past the kernel
    /// image; `reserved` marks firmware regions by physical address.
    pub fn boot_with_reserved(
        kernel_end: usize,
        reserved: impl Fn(usize) -> bool,
    ) -> Result<Self, BootError> {
        if kernel_end <= KERNEL_START_ADDR || kernel_end > KERNEL_STACK_TOP {
            return Err(BootError::BadKernelSpan);
        }
        let mut phys = PhysMemory::init(kernel_end, reserved);
        let kernel_space =
            kernel_address_space(&mut phys).map_err(|_| BootError::OutOfMemory)?;
        log_info!(target: "kernel", "booted, {} free frames", phys.free_frames());
        Ok(Kernel {
            phys,
            kernel_space,
            processes: ProcessTable::new(),
            scheduler: Scheduler::new(),
            ticks: 0,
        })
    }

    /// Builds a process in slot `pid` from `program`.
    pub fn setup(&mut self, pid: Pid, program: &Program) -> Result<(), SetupError> {
        self.processes
            .setup(&mut self.phys, &self.kernel_space, pid, program)?;
        log_info!(target: "kernel", "{pid} set up, entry {:#x}", program.entry);
        Ok(())
    }

    /// Handles one trap taken by the current process. `regs` is the
    /// register snapshot the trap entry saved.
    pub fn handle_trap(&mut self, trap: Trap, regs: Registers) -> Resumption {
        trap::dispatch(self, trap, regs)
    }

    /// Drives the machine: picks a process, lets `cpu` run it until a
    /// trap, dispatches, repeats. `cpu` receives the pid and a mutable
    /// snapshot of its saved registers and returns the trap that ended
    /// the quantum. While nothing is runnable the loop spins, polling
    /// `abort`; a requested abort then halts with
    /// [`HaltReason::Aborted`].
    pub fn run(
        &mut self,
        mut cpu: impl FnMut(Pid, &mut Registers) -> Trap,
        abort: &AbortSignal,
    ) -> HaltReason {
        let mut next = match self.scheduler.schedule(&self.processes) {
            Some(pid) => Resumption::Run(pid),
            None => Resumption::Idle,
        };
        loop {
            match next {
                Resumption::Run(pid) => {
                    let mut regs = match self.processes.get(pid) {
                        Some(p) => *p.registers(),
                        None => Registers::default(),
                    };
                    let trap = cpu(pid, &mut regs);
                    next = self.handle_trap(trap, regs);
                }
                Resumption::Idle => {
                    if abort.is_requested() {
                        return HaltReason::Aborted;
                    }
                    core::hint::spin_loop();
                    next = match self.scheduler.schedule(&self.processes) {
                        Some(pid) => Resumption::Run(pid),
                        None => Resumption::Idle,
                    };
                }
                Resumption::Halt(reason) => return reason,
            }
        }
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<&crate::task::Process> {
        self.processes.get(pid)
    }

    #[must_use]
    pub fn memory(&self) -> &PhysMemory {
        &self.phys
    }

    #[must_use]
    pub fn current(&self) -> Pid {
        self.scheduler.current()
    }

    /// Timer interrupts seen since boot.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
