// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small shared identifier types.

use core::fmt;

/// Process identifier.
///
/// Pids double as indices into the process table: pid `n` lives in slot
/// `n`. Slot 0 is permanently reserved so that "no process" never aliases
/// a real one; the scheduler and the fork slot scan both skip it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The reserved slot-0 pid. Never runnable, never owns a frame.
    pub const RESERVED: Pid = Pid(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Pid(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Index of this pid's slot in the process table.
    #[must_use]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// A virtual address already proven page-aligned.
///
/// Syscall arguments arrive as raw words; decoding them into `VirtAddr`
/// up front keeps the alignment check out of the paging code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Accepts `raw` only if it sits on a page boundary.
    #[must_use]
    pub const fn page_aligned(raw: usize) -> Option<Self> {
        if raw % crate::mm::PAGE_SIZE == 0 {
            Some(VirtAddr(raw))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
