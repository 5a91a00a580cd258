//! The pool of physical frames available to user pages.
//!
//! Frame memory is simulated: each frame is a page-sized buffer behind its own lock, addressed
//! by the physical address it stands for.

mod placement_algorithms;

use crate::sync::Mutex;
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;
use bitflags::bitflags;
use log::trace;
use placement_algorithms::NextFit;
use vmm_shared::mem::{PhysAddr, PAGE_FRAME_SIZE};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    user: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// The frame will hold a user page.
        const USER = 1 << 0;
        /// Zero the frame before returning it.
        const ZERO = 1 << 1;
    }
}

struct PoolState {
    core_map: Box<[CoreMapEntry]>,
    placement: NextFit,
    frames_allocated: usize,
}

pub struct FramePool {
    base: PhysAddr,
    memory: Box<[Mutex<Box<[u8]>>]>,
    state: Mutex<PoolState>,
}

impl FramePool {
    /// A pool of `frames` frames starting at the page-aligned address `base`.
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        assert!(base.is_page_aligned(), "frame pool base {base} is not page aligned");
        let memory = (0..frames)
            .map(|_| Mutex::new(vec![0u8; PAGE_FRAME_SIZE].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            base,
            memory,
            state: Mutex::new(PoolState {
                core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                placement: NextFit::default(),
                frames_allocated: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn free_frames(&self) -> usize {
        self.capacity() - self.state.lock().frames_allocated
    }

    fn index_of(&self, paddr: PhysAddr) -> Option<usize> {
        let index = paddr.frame_number().checked_sub(self.base.frame_number())?;
        (paddr.is_page_aligned() && index < self.capacity()).then_some(index)
    }

    /// Takes a free frame, or returns `None` if the pool is exhausted.
    pub fn alloc(&self, flags: AllocFlags) -> Option<PhysAddr> {
        let index = {
            let mut state = self.state.lock();
            let PoolState {
                core_map,
                placement,
                frames_allocated,
            } = &mut *state;

            let index = placement.place(core_map)?;
            core_map[index] = core_map[index]
                .with_allocated(true)
                .with_user(flags.contains(AllocFlags::USER));
            *frames_allocated += 1;
            index
        };

        let paddr = PhysAddr::from_frame_number(self.base.frame_number() + index);
        if flags.contains(AllocFlags::ZERO) {
            self.memory[index].lock().fill(0);
        }
        trace!("allocated frame {paddr}");
        Some(paddr)
    }

    /// Returns a frame to the pool.
    ///
    /// Panics if the frame is not part of the pool or is not allocated.
    pub fn dealloc(&self, paddr: PhysAddr) {
        let index = self
            .index_of(paddr)
            .unwrap_or_else(|| panic!("frame {paddr} is not part of the pool"));
        let mut state = self.state.lock();
        assert!(
            state.core_map[index].allocated(),
            "double free of frame {paddr}"
        );
        state.core_map[index] = CoreMapEntry::DEFAULT;
        state.frames_allocated -= 1;
        trace!("freed frame {paddr}");
    }

    /// Runs `f` on the contents of the frame at `paddr`.
    ///
    /// Panics if the frame is not part of the pool.
    pub fn with_frame<R>(&self, paddr: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let index = self
            .index_of(paddr)
            .unwrap_or_else(|| panic!("frame {paddr} is not part of the pool"));
        f(&mut self.memory[index].lock())
    }

    pub fn is_user(&self, paddr: PhysAddr) -> bool {
        self.index_of(paddr)
            .is_some_and(|index| self.state.lock().core_map[index].user())
    }
}
