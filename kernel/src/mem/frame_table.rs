//! Registry of frames holding user pages.
//!
//! A frame enters the table when it is handed out, pinned, by [`FrameTable::allocate`] and
//! leaves it once no page is attached and no pin is held. Frames claimed for eviction stay in
//! the table, pinned, until they are handed to the thread that needed a frame.

use crate::{
    mem::{
        frame_allocator::{AllocFlags, FramePool},
        page::PageId,
        page_replacement::PageReplacementPolicy,
        vm_error::{VmError, VmResult},
    },
    paging::{Asid, Mmu},
    sync::Mutex,
};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::mem;
use log::debug;
use smallvec::SmallVec;
use vmm_shared::mem::{PhysAddr, VirtAddr};

/// A user page attached to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMapping {
    pub page: PageId,
    pub asid: Asid,
    pub vaddr: VirtAddr,
}

pub type FramePages = SmallVec<[FrameMapping; 1]>;

#[derive(Debug, Clone)]
pub struct Frame {
    paddr: PhysAddr,
    pins: u32,
    evicting: bool,
    pages: FramePages,
}

impl Frame {
    pub fn new(paddr: PhysAddr) -> Self {
        Self {
            paddr,
            pins: 0,
            evicting: false,
            pages: SmallVec::new(),
        }
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pin_count(&self) -> u32 {
        self.pins
    }

    /// Claimed by an eviction that has not finished yet.
    pub fn is_evicting(&self) -> bool {
        self.evicting
    }

    pub fn pages(&self) -> &[FrameMapping] {
        &self.pages
    }

    #[cfg(test)]
    pub(crate) fn pages_mut(&mut self) -> &mut FramePages {
        &mut self.pages
    }

    pub(crate) fn pin(&mut self) {
        self.pins += 1;
    }

    fn is_releasable(&self) -> bool {
        self.pages.is_empty() && self.pins == 0 && !self.evicting
    }
}

#[derive(Default)]
struct FrameRegistry {
    frames: BTreeMap<PhysAddr, Frame>,
    /// Registration order, the order the clock hand sweeps in.
    order: Vec<PhysAddr>,
}

impl FrameRegistry {
    fn insert(&mut self, frame: Frame) {
        self.order.push(frame.paddr);
        self.frames.insert(frame.paddr, frame);
    }

    fn remove(&mut self, paddr: PhysAddr) -> Option<Frame> {
        let frame = self.frames.remove(&paddr)?;
        self.order.retain(|&p| p != paddr);
        Some(frame)
    }

    fn frame_mut(&mut self, paddr: PhysAddr) -> &mut Frame {
        self.frames
            .get_mut(&paddr)
            .unwrap_or_else(|| panic!("frame {paddr} is not in the frame table"))
    }
}

pub struct FrameTable {
    registry: Mutex<FrameRegistry>,
    /// Held for the whole victim scan, before the registry lock.
    policy: Mutex<Box<dyn PageReplacementPolicy>>,
    pool: FramePool,
}

impl FrameTable {
    pub fn new(pool: FramePool, policy: Box<dyn PageReplacementPolicy>) -> Self {
        Self {
            registry: Mutex::new(FrameRegistry::default()),
            policy: Mutex::new(policy),
            pool,
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Hands out a pinned frame. When the pool is empty `evict` is run once; it must return a
    /// frame claimed by [`FrameTable::select_victim`] with every page detached.
    pub fn allocate(
        &self,
        flags: AllocFlags,
        evict: impl FnOnce() -> VmResult<PhysAddr>,
    ) -> VmResult<FramePin<'_>> {
        if let Some(paddr) = self.pool.alloc(flags) {
            let mut frame = Frame::new(paddr);
            frame.pin();
            self.registry.lock().insert(frame);
            return Ok(FramePin { table: self, paddr });
        }

        let paddr = evict()?;
        self.reuse(paddr, flags);
        Ok(FramePin { table: self, paddr })
    }

    /// Ends the eviction of a claimed frame, keeping the claim's pin for the new owner.
    fn reuse(&self, paddr: PhysAddr, flags: AllocFlags) {
        {
            let mut registry = self.registry.lock();
            let frame = registry.frame_mut(paddr);
            assert!(frame.evicting, "frame {paddr} was not claimed for eviction");
            assert!(
                frame.pages.is_empty(),
                "evicted frame {paddr} still holds {:?}",
                frame.pages
            );
            frame.evicting = false;
        }
        if flags.contains(AllocFlags::ZERO) {
            self.pool.with_frame(paddr, |mem| mem.fill(0));
        }
    }

    /// A snapshot of the frame at `paddr`.
    pub fn lookup(&self, paddr: PhysAddr) -> Option<Frame> {
        self.registry.lock().frames.get(&paddr).cloned()
    }

    /// Attaches a page to a frame. The frame must be in the table.
    pub fn attach(&self, paddr: PhysAddr, mapping: FrameMapping) {
        self.registry.lock().frame_mut(paddr).pages.push(mapping);
    }

    /// Detaches a page from a frame, releasing the frame if nothing else holds it.
    pub fn detach(&self, paddr: PhysAddr, page: PageId) {
        let mut registry = self.registry.lock();
        let frame = registry.frame_mut(paddr);
        let before = frame.pages.len();
        frame.pages.retain(|m| m.page != page);
        assert_ne!(
            before,
            frame.pages.len(),
            "page {page:?} is not attached to frame {paddr}"
        );
        if frame.is_releasable() {
            self.release_locked(&mut registry, paddr);
        }
    }

    /// Pins the frame unless it is missing or being evicted.
    pub fn try_pin(&self, paddr: PhysAddr) -> Option<FramePin<'_>> {
        let mut registry = self.registry.lock();
        let frame = registry.frames.get_mut(&paddr)?;
        if frame.evicting {
            return None;
        }
        frame.pin();
        Some(FramePin { table: self, paddr })
    }

    /// Drops one pin. The frame is released if it was the last thing holding it.
    ///
    /// Panics if the frame is not pinned.
    pub fn unpin(&self, paddr: PhysAddr) {
        let mut registry = self.registry.lock();
        let frame = registry.frame_mut(paddr);
        assert!(frame.pins > 0, "unpin of unpinned frame {paddr}");
        frame.pins -= 1;
        if frame.is_releasable() {
            self.release_locked(&mut registry, paddr);
        }
    }

    /// Removes an unused frame from the table and returns it to the pool. Frames that still
    /// hold pages or pins are left alone.
    pub fn release(&self, paddr: PhysAddr) {
        let mut registry = self.registry.lock();
        let releasable = match registry.frames.get(&paddr) {
            Some(frame) if frame.is_releasable() => true,
            Some(frame) => {
                debug!("not releasing frame {paddr} in use: {frame:?}");
                false
            }
            None => false,
        };
        if releasable {
            self.release_locked(&mut registry, paddr);
        }
    }

    fn release_locked(&self, registry: &mut FrameRegistry, paddr: PhysAddr) {
        registry.remove(paddr);
        self.pool.dealloc(paddr);
    }

    /// Runs the replacement policy and claims the chosen frame: it is pinned and marked as
    /// being evicted before the locks are dropped, so no other thread can pin or choose it.
    /// Returns the frame and the pages that must be unloaded from it.
    pub fn select_victim(&self, mmu: &dyn Mmu) -> VmResult<(PhysAddr, FramePages)> {
        let mut policy = self.policy.lock();
        let mut registry = self.registry.lock();

        let victim = {
            let frames: Vec<&Frame> = registry
                .order
                .iter()
                .filter_map(|paddr| registry.frames.get(paddr))
                .collect();
            let index = policy
                .select_victim(&frames, &mut |m: &FrameMapping| {
                    let accessed = mmu.is_accessed(m.asid, m.vaddr);
                    if accessed {
                        mmu.set_accessed(m.asid, m.vaddr, false);
                    }
                    accessed
                })
                .ok_or(VmError::OutOfFrames)?;
            frames[index].paddr
        };

        let frame = registry.frame_mut(victim);
        frame.pin();
        frame.evicting = true;
        debug!("evicting frame {victim} holding {:?}", frame.pages);
        Ok((victim, frame.pages.clone()))
    }

    /// Runs `f` on the contents of the frame at `paddr`.
    pub fn with_frame<R>(&self, paddr: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.pool.with_frame(paddr, f)
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.registry.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every frame, in clock order.
    pub fn frames(&self) -> Vec<Frame> {
        let registry = self.registry.lock();
        registry
            .order
            .iter()
            .filter_map(|paddr| registry.frames.get(paddr).cloned())
            .collect()
    }
}

/// A pin on a frame, dropped when the guard goes out of scope.
#[must_use = "the frame is unpinned as soon as the guard is dropped"]
pub struct FramePin<'a> {
    table: &'a FrameTable,
    paddr: PhysAddr,
}

impl FramePin<'_> {
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Keeps the frame pinned past the guard. Release it with [`FrameTable::unpin`].
    pub fn leak(self) -> PhysAddr {
        let paddr = self.paddr;
        mem::forget(self);
        paddr
    }
}

impl Drop for FramePin<'_> {
    fn drop(&mut self) {
        self.table.unpin(self.paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem::page_replacement::ClockEviction, paging::SoftMmu};
    use vmm_shared::mem::{PAGE_FRAME_SIZE, UPPER_MEMORY_START};

    fn table(frames: usize) -> FrameTable {
        FrameTable::new(
            FramePool::new(PhysAddr::new(UPPER_MEMORY_START), frames),
            Box::new(ClockEviction::new()),
        )
    }

    fn mapping(page: usize) -> FrameMapping {
        FrameMapping {
            page: PageId(page),
            asid: 1,
            vaddr: VirtAddr::new((page + 1) * PAGE_FRAME_SIZE),
        }
    }

    fn no_eviction() -> VmResult<PhysAddr> {
        panic!("unexpected eviction")
    }

    #[test]
    fn allocated_frames_are_pinned_until_dropped() {
        let table = table(2);
        let pin = table.allocate(AllocFlags::USER, no_eviction).unwrap();
        let paddr = pin.paddr();
        assert!(table.lookup(paddr).unwrap().is_pinned());
        table.attach(paddr, mapping(0));
        drop(pin);

        let frame = table.lookup(paddr).unwrap();
        assert!(!frame.is_pinned());
        assert_eq!(frame.pages(), [mapping(0)]);
        assert_eq!(table.pool().free_frames(), 1);
    }

    #[test]
    fn detach_releases_unpinned_frame() {
        let table = table(1);
        let paddr = table.allocate(AllocFlags::USER, no_eviction).unwrap().leak();
        table.attach(paddr, mapping(0));
        table.unpin(paddr);

        table.detach(paddr, PageId(0));
        assert!(table.lookup(paddr).is_none());
        assert!(table.is_empty());
        assert_eq!(table.pool().free_frames(), 1);
    }

    #[test]
    fn release_keeps_frames_in_use() {
        let table = table(1);
        let pin = table.allocate(AllocFlags::USER, no_eviction).unwrap();
        table.release(pin.paddr());
        assert_eq!(table.len(), 1);
        drop(pin);
        assert!(table.is_empty());
    }

    #[test]
    fn exhausted_pool_takes_evicted_frame() {
        let table = table(1);
        let mmu = SoftMmu::new();
        let pin = table.allocate(AllocFlags::USER, no_eviction).unwrap();
        let first = pin.paddr();
        table.attach(first, mapping(0));
        drop(pin);

        let second = table
            .allocate(AllocFlags::USER | AllocFlags::ZERO, || {
                let (victim, pages) = table.select_victim(&mmu)?;
                assert!(table.try_pin(victim).is_none());
                assert_eq!(pages.as_slice(), [mapping(0)]);
                table.detach(victim, PageId(0));
                Ok(victim)
            })
            .unwrap();
        assert_eq!(second.paddr(), first);
        let frame = table.lookup(first).unwrap();
        assert_eq!(frame.pin_count(), 1);
        assert!(!frame.is_evicting());
    }

    #[test]
    fn all_pinned_reports_out_of_frames() {
        let table = table(1);
        let mmu = SoftMmu::new();
        let pin = table.allocate(AllocFlags::USER, no_eviction).unwrap();
        table.attach(pin.paddr(), mapping(0));
        let result = table.allocate(AllocFlags::USER, || {
            table.select_victim(&mmu).map(|(victim, _)| victim)
        });
        assert_eq!(result.err(), Some(VmError::OutOfFrames));
    }

    #[test]
    #[should_panic(expected = "unpin of unpinned frame")]
    fn unpin_without_pin_panics() {
        let table = table(1);
        let paddr = table.allocate(AllocFlags::USER, no_eviction).unwrap().leak();
        table.attach(paddr, mapping(0));
        table.unpin(paddr);
        table.unpin(paddr);
    }
}
