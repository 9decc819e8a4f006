// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! SYNAPSE: a single-core, protected-mode teaching kernel core.
//!
//! The crate models the machine-independent half of a tiny kernel: the
//! physical-page ownership table, per-process address spaces, the trap
//! dispatcher and a round-robin scheduler. Hardware bring-up, the console
//! driver and the trap-entry assembly are external collaborators; the
//! embedder resumes user code through the closure handed to
//! [`kernel::Kernel::run`] and feeds every resulting trap back in.
//!
//! Physical memory is one arena of 4 KiB frames ([`mm::PhysMemory`]).
//! Page-table nodes and user data pages are both plain frames in that
//! arena, so ownership and paging share a single allocation substrate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod log;

pub mod check;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod task;
pub mod trap;
pub mod types;

pub use check::Violation;
pub use kernel::{AbortSignal, BootError, Kernel};
pub use mm::{PageFlags, PAGE_SIZE};
pub use trap::{HaltReason, Registers, Resumption, Trap};
pub use types::Pid;
