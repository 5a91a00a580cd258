use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory. Sectors start zeroed.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    fn range(&self, sector: BlockSector) -> Option<core::ops::Range<usize>> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector).ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector).ok_or(BlockError::WriteError)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
