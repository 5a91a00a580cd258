use crate::block::block_error::BlockError;
use alloc::{boxed::Box, string::String};
use core::fmt;
use log::trace;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = vmm_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// File system
    FileSystem,
    /// Swap
    Swap,
    /// Scratch
    Scratch,
    /// "Raw" device with unidentified contents
    Raw,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Raw => write!(f, "Raw"),
        }
    }
}

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
pub struct Block {
    /// The name of the block device
    block_name: String,
    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    read_count: u32,
    write_count: u32,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(buf.len()));
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        trace!("{}: read sector {}", self.block_name, sector);
        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        trace!("{}: write sector {}", self.block_name, sector);
        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_read_count(&self) -> u32 {
        self.read_count
    }
    pub fn get_write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}
