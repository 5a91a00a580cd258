//! Swap space: page-sized runs of sectors on the swap block device, tracked by a bitmap with
//! one bit per sector.

use crate::{
    block::block_core::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE},
    mem::vm_error::{VmError, VmResult},
    sync::Mutex,
};
use alloc::{vec, vec::Vec};
use log::{trace, warn};
use vmm_shared::mem::PAGE_FRAME_SIZE;

/// Number of sectors holding one page.
// A page is a handful of sectors, far below `BlockSector::MAX`.
#[allow(clippy::cast_possible_truncation)]
pub const SECTORS_PER_PAGE: BlockSector = (PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE) as BlockSector;

/// A run of `SECTORS_PER_PAGE` sectors, identified by its first sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(BlockSector);

impl SwapSlot {
    pub fn first_sector(self) -> BlockSector {
        self.0
    }

    fn sectors(self) -> impl Iterator<Item = BlockSector> {
        self.0..self.0 + SECTORS_PER_PAGE
    }
}

struct SwapState {
    block: Block,
    /// Bit `n` is set iff sector `n` holds swapped data.
    bitmap: Vec<u64>,
}

impl SwapState {
    fn test(&self, sector: BlockSector) -> bool {
        let sector = sector as usize;
        (self.bitmap[sector / 64] >> (sector % 64)) & 1 != 0
    }

    fn set(&mut self, sector: BlockSector, value: bool) {
        let sector = sector as usize;
        let mask = 1 << (sector % 64);
        if value {
            self.bitmap[sector / 64] |= mask;
        } else {
            self.bitmap[sector / 64] &= !mask;
        }
    }

    fn slots_total(&self) -> BlockSector {
        self.block.get_size() / SECTORS_PER_PAGE
    }

    fn in_use(&self, slot: SwapSlot) -> bool {
        slot.sectors().all(|sector| self.test(sector))
    }

    fn check_in_use(&self, slot: SwapSlot, what: &str) {
        assert!(
            slot.0 % SECTORS_PER_PAGE == 0 && slot.0 < self.block.get_size() && self.in_use(slot),
            "{what} swap slot {} which is not in use",
            slot.0
        );
    }

    fn allocate(&mut self) -> VmResult<SwapSlot> {
        let slot = (0..self.slots_total())
            .map(|i| SwapSlot(i * SECTORS_PER_PAGE))
            .find(|&slot| slot.sectors().all(|sector| !self.test(sector)))
            .ok_or(VmError::SwapExhausted)?;
        for sector in slot.sectors() {
            self.set(sector, true);
        }
        Ok(slot)
    }

    fn free(&mut self, slot: SwapSlot) {
        self.check_in_use(slot, "freeing");
        for sector in slot.sectors() {
            self.set(sector, false);
        }
    }

    fn read(&mut self, slot: SwapSlot, buf: &mut [u8]) -> VmResult<()> {
        self.check_in_use(slot, "reading");
        for (sector, chunk) in slot.sectors().zip(buf.chunks_mut(BLOCK_SECTOR_SIZE)) {
            self.block.read(sector, chunk)?;
        }
        Ok(())
    }

    fn write(&mut self, slot: SwapSlot, buf: &[u8]) -> VmResult<()> {
        self.check_in_use(slot, "writing");
        for (sector, chunk) in slot.sectors().zip(buf.chunks(BLOCK_SECTOR_SIZE)) {
            self.block.write(sector, chunk)?;
        }
        Ok(())
    }
}

pub struct SwapSpace {
    state: Mutex<SwapState>,
}

impl SwapSpace {
    /// Uses `block` as swap. Any trailing sectors that do not fill a page are left unused.
    pub fn new(block: Block) -> Self {
        if block.get_type() != BlockType::Swap {
            warn!("using {} block \"{}\" as swap", block.get_type(), block.get_name());
        }
        let bitmap = vec![0; (block.get_size() as usize).div_ceil(64)];
        Self {
            state: Mutex::new(SwapState { block, bitmap }),
        }
    }

    /// Reserves a free slot.
    pub fn allocate(&self) -> VmResult<SwapSlot> {
        self.state.lock().allocate()
    }

    /// Returns a slot to the free set.
    ///
    /// Panics if the slot is not in use.
    pub fn free(&self, slot: SwapSlot) {
        self.state.lock().free(slot);
    }

    /// Reads a page from `slot`. `buf` must be a page long.
    pub fn read(&self, slot: SwapSlot, buf: &mut [u8]) -> VmResult<()> {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        self.state.lock().read(slot, buf)
    }

    /// Writes a page to `slot`. `buf` must be a page long.
    pub fn write(&self, slot: SwapSlot, buf: &[u8]) -> VmResult<()> {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        self.state.lock().write(slot, buf)
    }

    /// Writes a page to a newly allocated slot. The slot is given back if the write fails.
    pub fn swap_out(&self, buf: &[u8]) -> VmResult<SwapSlot> {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        let mut state = self.state.lock();
        let slot = state.allocate()?;
        if let Err(e) = state.write(slot, buf) {
            state.free(slot);
            return Err(e);
        }
        trace!("swapped out to slot {}", slot.0);
        Ok(slot)
    }

    /// Reads a page back from `slot` and frees the slot.
    pub fn swap_in(&self, slot: SwapSlot, buf: &mut [u8]) -> VmResult<()> {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        let mut state = self.state.lock();
        state.read(slot, buf)?;
        state.free(slot);
        trace!("swapped in from slot {}", slot.0);
        Ok(())
    }

    pub fn slots_total(&self) -> usize {
        self.state.lock().slots_total() as usize
    }

    pub fn slots_in_use(&self) -> usize {
        let state = self.state.lock();
        (0..state.slots_total())
            .filter(|&i| state.in_use(SwapSlot(i * SECTORS_PER_PAGE)))
            .count()
    }

    /// Copy of the sector bitmap.
    pub fn bitmap_snapshot(&self) -> Vec<u64> {
        self.state.lock().bitmap.clone()
    }
}
