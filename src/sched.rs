// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler driven by the trap dispatcher
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/current/schedule)
//! DEPENDS_ON: task::{ProcessTable,ProcessState}, types::Pid
//! INVARIANTS: Cyclic scan starts after current and considers it last; the reserved slot is never picked; None leaves current unchanged

use crate::task::{ProcessState, ProcessTable, NPROC};
use crate::types::Pid;

/// Cyclic scan over the process table, starting after the last pick.
pub struct Scheduler {
    current: Pid,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Scheduler {
            current: Pid::RESERVED,
        }
    }

    /// The process whose trap is being handled. [`Pid::RESERVED`] before
    /// the first pick.
    #[must_use]
    pub fn current(&self) -> Pid {
        self.current
    }

    /// Picks the next runnable process after the current one, wrapping
    /// around and considering the current process last. `None` when
    /// nothing is runnable; the current pick is then left unchanged.
    pub fn schedule(&mut self, table: &ProcessTable) -> Option<Pid> {
        let start = self.current.as_index();
        for offset in 1..=NPROC {
            let candidate = Pid::from_raw(((start + offset) % NPROC) as u32);
            if table.state(candidate) == ProcessState::Runnable {
                self.current = candidate;
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}
