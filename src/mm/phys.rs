// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The frame arena: ownership, reference counts and frame bytes.
//!
//! Every physical frame has exactly one owner tag and a reference count.
//! The count tracks how many address-space leaf mappings reference the
//! frame (kernel identity mappings excluded); a frame is allocatable iff
//! its count is zero. Ownership and count are deliberately independent:
//! an owner may drop its claim while other references remain, leaving a
//! `Free` frame with a nonzero count that stays unallocatable until the
//! last reference goes away.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::mm::{page_number, NPAGES, PAGE_SIZE};
use crate::types::Pid;

/// Who holds a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOwner {
    /// Unowned. Allocatable when the refcount is also zero.
    Free,
    /// Hardware or firmware region, never allocatable.
    Reserved,
    /// Kernel code, data, stack or the shared kernel page table.
    Kernel,
    /// Owned by the process in this slot.
    Process(Pid),
}

/// Why a direct frame claim was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum PhysError {
    Unaligned,
    OutOfRange,
    /// Frame already referenced.
    InUse,
}

impl fmt::Display for PhysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysError::Unaligned => write!(f, "physical address not page-aligned"),
            PhysError::OutOfRange => write!(f, "physical address out of range"),
            PhysError::InUse => write!(f, "frame already in use"),
        }
    }
}

struct Frame {
    owner: PageOwner,
    refcount: u16,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Frame {
    fn new(owner: PageOwner) -> Self {
        let refcount = u16::from(owner != PageOwner::Free);
        Frame {
            owner,
            refcount,
            data: Box::new([0; PAGE_SIZE]),
        }
    }
}

/// The default firmware hole: the zero page and the legacy I/O window
/// between 640 KiB and 1 MiB (which contains the console buffer).
#[must_use]
pub fn default_reserved(pa: usize) -> bool {
    pa < PAGE_SIZE || (0xA0000..0x100000).contains(&pa)
}

/// The whole of physical memory, one record per frame.
pub struct PhysMemory {
    frames: Vec<Frame>,
}

impl PhysMemory {
    /// Seeds the arena. Frames below `kernel_end` starting at the kernel
    /// image, plus the kernel stack region, are tagged `Kernel`; frames
    /// matching `reserved` are tagged `Reserved`; the rest start `Free`.
    pub fn init(kernel_end: usize, reserved: impl Fn(usize) -> bool) -> Self {
        use crate::mm::{KERNEL_STACK_TOP, KERNEL_START_ADDR};
        let mut frames = Vec::with_capacity(NPAGES);
        for pn in 0..NPAGES {
            let pa = pn * PAGE_SIZE;
            let owner = if reserved(pa) {
                PageOwner::Reserved
            } else if (KERNEL_START_ADDR..kernel_end).contains(&pa)
                || (kernel_end..KERNEL_STACK_TOP).contains(&pa)
            {
                PageOwner::Kernel
            } else {
                PageOwner::Free
            };
            frames.push(Frame::new(owner));
        }
        PhysMemory { frames }
    }

    /// Hands out the lowest-numbered unreferenced frame, zeroed, with a
    /// refcount of one and `owner` recorded. `None` when memory is full.
    pub fn find_free_page(&mut self, owner: PageOwner) -> Option<usize> {
        debug_assert!(owner != PageOwner::Free && owner != PageOwner::Reserved);
        let pn = self.frames.iter().position(|f| f.refcount == 0)?;
        let frame = &mut self.frames[pn];
        frame.owner = owner;
        frame.refcount = 1;
        frame.data.fill(0);
        Some(pn)
    }

    /// Drops one reference to `pn` on behalf of `claimant`.
    ///
    /// The frame becomes `Free` when the last reference goes, and also,
    /// early, when the claimant is the recorded owner: the owner may
    /// disclaim a still-shared frame, which then lingers unowned and
    /// unallocatable until the remaining references drain.
    pub fn release_page(&mut self, pn: usize, claimant: Pid) {
        let frame = &mut self.frames[pn];
        debug_assert!(frame.refcount > 0, "releasing unreferenced frame {pn}");
        frame.refcount = frame.refcount.saturating_sub(1);
        if frame.refcount == 0 || frame.owner == PageOwner::Process(claimant) {
            frame.owner = PageOwner::Free;
        }
    }

    /// Adds a reference to an already-referenced frame (read-only sharing).
    pub fn retain_page(&mut self, pn: usize) {
        let frame = &mut self.frames[pn];
        debug_assert!(frame.refcount > 0, "retaining unreferenced frame {pn}");
        frame.refcount += 1;
    }

    /// Claims the specific frame at `pa` for `owner`. Unlike
    /// [`find_free_page`](Self::find_free_page) the frame keeps its bytes.
    pub fn assign_physical_page(&mut self, pa: usize, owner: PageOwner) -> Result<(), PhysError> {
        if pa % PAGE_SIZE != 0 {
            return Err(PhysError::Unaligned);
        }
        let pn = page_number(pa);
        let frame = self.frames.get_mut(pn).ok_or(PhysError::OutOfRange)?;
        if frame.refcount != 0 {
            return Err(PhysError::InUse);
        }
        frame.owner = owner;
        frame.refcount = 1;
        Ok(())
    }

    #[must_use]
    pub fn owner(&self, pn: usize) -> PageOwner {
        self.frames[pn].owner
    }

    #[must_use]
    pub fn refcount(&self, pn: usize) -> u16 {
        self.frames[pn].refcount
    }

    /// Frames currently allocatable.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.refcount == 0).count()
    }

    #[must_use]
    pub fn page_bytes(&self, pn: usize) -> &[u8; PAGE_SIZE] {
        &self.frames[pn].data
    }

    pub fn page_bytes_mut(&mut self, pn: usize) -> &mut [u8; PAGE_SIZE] {
        &mut self.frames[pn].data
    }

    /// Copies the 4 KiB of frame `src` into frame `dst`.
    pub fn copy_page(&mut self, dst: usize, src: usize) {
        debug_assert_ne!(dst, src);
        let (lo, hi) = if dst < src { (dst, src) } else { (src, dst) };
        let (head, tail) = self.frames.split_at_mut(hi);
        let (a, b) = (&mut head[lo], &mut tail[0]);
        if dst < src {
            a.data.copy_from_slice(&b.data[..]);
        } else {
            b.data.copy_from_slice(&a.data[..]);
        }
    }
}
