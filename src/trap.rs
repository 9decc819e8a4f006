// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap decoding and dispatch for the SYNAPSE kernel
//! OWNERS: @kernel-team
//! PUBLIC API: Trap (decode), Registers, Resumption, HaltReason, vector::*, fault::*, SYSCALL_FAILURE, last_trap
//! DEPENDS_ON: check, kernel::Kernel, mm, task, types
//! INVARIANTS: Every trap exits through a Resumption (no divergent trap-return); syscall failures return -1; kernel-mode faults and unknown vectors halt; debug builds audit after every trap

use core::fmt;

use spin::Mutex;

use crate::check;
use crate::kernel::Kernel;
use crate::log_error;
use crate::mm::phys::PageOwner;
use crate::mm::{page_address, PageFlags, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::task::ProcessState;
use crate::types::{Pid, VirtAddr};

/// Hardware vector numbers.
pub mod vector {
    pub const PAGE_FAULT: u8 = 14;
    pub const TIMER: u8 = 32;
    pub const SYS_PANIC: u8 = 48;
    pub const SYS_GETPID: u8 = 49;
    pub const SYS_YIELD: u8 = 50;
    pub const SYS_PAGE_ALLOC: u8 = 51;
    pub const SYS_FORK: u8 = 52;
    pub const SYS_EXIT: u8 = 53;
}

/// Page-fault error-code bits.
pub mod fault {
    /// Set when the fault was a protection violation rather than a
    /// missing translation.
    pub const PROTECTION: u8 = 1 << 0;
    /// Set when the access was a write.
    pub const WRITE: u8 = 1 << 1;
    /// Set when the access came from user mode.
    pub const USER: u8 = 1 << 2;
}

/// The architectural state the trap entry stub saves and restores:
/// program counter, stack pointer, the syscall argument register and
/// the return-value register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    pub arg: usize,
    pub ret: usize,
}

/// Syscall return value for any failure.
pub const SYSCALL_FAILURE: usize = -1isize as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    GetPid,
    Yield,
    PageAlloc,
    Fork,
    Exit,
    Panic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    /// No translation was present.
    Missing,
    /// A translation was present but forbade the access.
    Protection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub access: Access,
    pub cause: FaultCause,
    pub privilege: Privilege,
}

/// One decoded trap event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Syscall(Syscall),
    Timer,
    PageFault(PageFault),
    Unknown(u8),
}

impl Trap {
    /// Decodes a raw vector, error code and fault address. The error
    /// code and address are only meaningful for page faults.
    #[must_use]
    pub fn decode(vec: u8, code: u8, addr: usize) -> Trap {
        match vec {
            vector::PAGE_FAULT => Trap::PageFault(PageFault {
                addr,
                access: if code & fault::WRITE != 0 {
                    Access::Write
                } else {
                    Access::Read
                },
                cause: if code & fault::PROTECTION != 0 {
                    FaultCause::Protection
                } else {
                    FaultCause::Missing
                },
                privilege: if code & fault::USER != 0 {
                    Privilege::User
                } else {
                    Privilege::Kernel
                },
            }),
            vector::TIMER => Trap::Timer,
            vector::SYS_PANIC => Trap::Syscall(Syscall::Panic),
            vector::SYS_GETPID => Trap::Syscall(Syscall::GetPid),
            vector::SYS_YIELD => Trap::Syscall(Syscall::Yield),
            vector::SYS_PAGE_ALLOC => Trap::Syscall(Syscall::PageAlloc),
            vector::SYS_FORK => Trap::Syscall(Syscall::Fork),
            vector::SYS_EXIT => Trap::Syscall(Syscall::Exit),
            other => Trap::Unknown(other),
        }
    }
}

/// Why the kernel stopped for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// A process asked for a kernel panic.
    Panic(Pid),
    /// A page fault while already in kernel mode.
    KernelPageFault { addr: usize, pc: usize },
    /// A vector the kernel has no handler for.
    UnknownVector(u8),
    /// A kernel-state audit found corruption.
    InvariantViolation(check::Violation),
    /// The embedder requested shutdown while the kernel was idle.
    Aborted,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Panic(pid) => write!(f, "panic requested by {pid}"),
            HaltReason::KernelPageFault { addr, pc } => {
                write!(f, "kernel page fault at {addr:#x} (pc {pc:#x})")
            }
            HaltReason::UnknownVector(v) => write!(f, "unhandled trap vector {v}"),
            HaltReason::InvariantViolation(v) => write!(f, "invariant violation: {v}"),
            HaltReason::Aborted => write!(f, "abort requested"),
        }
    }
}

/// What the outer loop should do after a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Resumption {
    /// Resume this process with its saved registers.
    Run(Pid),
    /// Nothing runnable; wait for something to change.
    Idle,
    /// Stop the machine.
    Halt(HaltReason),
}

/// Last trap seen, for post-mortem inspection.
static LAST_TRAP: Mutex<Option<(Trap, Registers)>> = Mutex::new(None);

fn record(trap: Trap, regs: Registers) {
    *LAST_TRAP.lock() = Some((trap, regs));
}

#[must_use]
pub fn last_trap() -> Option<(Trap, Registers)> {
    *LAST_TRAP.lock()
}

/// Handles one trap taken by the current process.
pub(crate) fn dispatch(kernel: &mut Kernel, trap: Trap, regs: Registers) -> Resumption {
    let pid = kernel.scheduler.current();
    if let Some(p) = kernel.processes.get_mut(pid) {
        *p.registers_mut() = regs;
    }
    record(trap, regs);

    let mut reschedule = false;
    match trap {
        Trap::Syscall(Syscall::Panic) => return Resumption::Halt(HaltReason::Panic(pid)),
        Trap::Syscall(Syscall::GetPid) => {
            if let Some(p) = kernel.processes.get_mut(pid) {
                p.registers_mut().ret = pid.as_raw() as usize;
            }
        }
        Trap::Syscall(Syscall::Yield) => reschedule = true,
        Trap::Syscall(Syscall::PageAlloc) => sys_page_alloc(kernel, pid),
        Trap::Syscall(Syscall::Fork) => sys_fork(kernel, pid),
        Trap::Syscall(Syscall::Exit) => {
            kernel.processes.cleanup(&mut kernel.phys, pid);
            reschedule = true;
        }
        Trap::Timer => {
            kernel.ticks += 1;
            reschedule = true;
        }
        Trap::PageFault(f) => {
            if f.privilege == Privilege::Kernel {
                return Resumption::Halt(HaltReason::KernelPageFault {
                    addr: f.addr,
                    pc: regs.pc,
                });
            }
            log_error!(
                target: "trap",
                "{pid} page fault at {:#x} (pc {:#x}, {:?} {:?})",
                f.addr, regs.pc, f.access, f.cause
            );
            if let Some(p) = kernel.processes.get_mut(pid) {
                p.set_state(ProcessState::Broken);
            }
            reschedule = true;
        }
        Trap::Unknown(v) => return Resumption::Halt(HaltReason::UnknownVector(v)),
    }

    if cfg!(debug_assertions) {
        if let Err(v) = check::audit(kernel) {
            return Resumption::Halt(HaltReason::InvariantViolation(v));
        }
    }

    let next = if !reschedule && kernel.processes.state(pid) == ProcessState::Runnable {
        Some(pid)
    } else {
        kernel.scheduler.schedule(&kernel.processes)
    };
    match next {
        Some(p) => Resumption::Run(p),
        None => Resumption::Idle,
    }
}

fn fail(kernel: &mut Kernel, pid: Pid) {
    if let Some(p) = kernel.processes.get_mut(pid) {
        p.registers_mut().ret = SYSCALL_FAILURE;
    }
}

/// Maps one fresh writable page at the address in the argument register.
fn sys_page_alloc(kernel: &mut Kernel, pid: Pid) {
    let Some(caller) = kernel.processes.get(pid) else {
        return;
    };
    let arg = caller.registers().arg;
    let Some(table) = caller.page_table().copied() else {
        return fail(kernel, pid);
    };
    let Some(va) = VirtAddr::page_aligned(arg) else {
        return fail(kernel, pid);
    };
    if !(PROC_START_ADDR..MEMSIZE_VIRTUAL).contains(&va.raw()) {
        return fail(kernel, pid);
    }
    if table.lookup(&kernel.phys, va.raw()).is_some() {
        return fail(kernel, pid);
    }
    let Some(pn) = kernel.phys.find_free_page(PageOwner::Process(pid)) else {
        return fail(kernel, pid);
    };
    if table
        .map(&mut kernel.phys, va.raw(), page_address(pn), PageFlags::FULL)
        .is_err()
    {
        kernel.phys.release_page(pn, pid);
        return fail(kernel, pid);
    }
    if let Some(p) = kernel.processes.get_mut(pid) {
        p.registers_mut().ret = 0;
    }
}

/// Duplicates the current process; the parent's return value is the
/// child pid on success, the child's is zero.
fn sys_fork(kernel: &mut Kernel, parent: Pid) {
    match kernel.processes.fork(&mut kernel.phys, parent) {
        Some(child) => {
            if let Some(p) = kernel.processes.get_mut(parent) {
                p.registers_mut().ret = child.as_raw() as usize;
            }
        }
        None => fail(kernel, parent),
    }
}
