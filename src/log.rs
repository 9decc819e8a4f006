// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Leveled diagnostics with an in-memory ring.
//!
//! The kernel core has no console of its own, so log lines land in a
//! fixed-size ring the embedder (or a test) drains. Levels above the
//! compiled threshold cost one atomic load and nothing else.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

/// Runtime threshold; lines above it are dropped before formatting.
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

const RING_LEN: usize = 128;

struct Ring {
    lines: [Option<String>; RING_LEN],
    next: usize,
}

const EMPTY: Option<String> = None;

static RING: Mutex<Ring> = Mutex::new(Ring {
    lines: [EMPTY; RING_LEN],
    next: 0,
});

/// Formats one line into the ring. Called through the `log_*` macros.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let line = format!("[{:5} {}] {}", level.tag(), target, args);
    let mut ring = RING.lock();
    let slot = ring.next % RING_LEN;
    ring.lines[slot] = Some(line);
    ring.next += 1;
}

/// Takes all buffered lines, oldest first, and clears the ring.
#[must_use]
pub fn drain() -> Vec<String> {
    let mut ring = RING.lock();
    let mut out = Vec::new();
    let start = ring.next.saturating_sub(RING_LEN);
    for seq in start..ring.next {
        if let Some(line) = ring.lines[seq % RING_LEN].take() {
            out.push(line);
        }
    }
    ring.next = 0;
    out
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+))
    };
}
