use crate::{block::block_error::BlockError, mem::page::PageId, mem::vma::MapId};
use thiserror::Error;
use vmm_shared::mem::VirtAddr;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// No free frame and no evictable one.
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("swap device is full")]
    SwapExhausted,
    #[error("short read filling {vaddr}: expected {expected} bytes, got {actual}")]
    ShortRead {
        vaddr: VirtAddr,
        expected: usize,
        actual: usize,
    },
    #[error("block device error: {0}")]
    Block(#[from] BlockError),

    #[error("page {0} is already loaded")]
    AlreadyLoaded(VirtAddr),
    #[error("page {0} is not loaded")]
    NotLoaded(VirtAddr),
    #[error("no page descriptor {0:?}")]
    UnknownPage(PageId),
    #[error("{0} is already described")]
    AlreadyMapped(VirtAddr),
    #[error("{0} is not page aligned")]
    Misaligned(VirtAddr),
    #[error("null address")]
    NullAddress,
    #[error("{0} is outside user space")]
    BadAddress(VirtAddr),

    #[error("zero-length mapping")]
    EmptyMapping,
    #[error("no mapping {0:?}")]
    UnknownMapping(MapId),
    #[error("invalid backing: {0}")]
    InvalidBacking(&'static str),
    #[error("could not install mapping for {0}")]
    MappingFailed(VirtAddr),

    /// Access to an address nothing describes.
    #[error("segmentation fault at {0}")]
    SegmentationFault(VirtAddr),
    #[error("write to read-only page {0}")]
    ReadOnly(VirtAddr),
}
