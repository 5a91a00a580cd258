pub mod frame_allocator;
pub mod frame_table;
pub mod page;
pub mod page_replacement;
pub mod swapping;
pub mod virtual_memory;
pub mod vm_error;
pub mod vma;

pub use frame_allocator::{AllocFlags, FramePool};
pub use frame_table::{FrameMapping, FramePin, FrameTable};
pub use page::{Backing, PageId, PageInfo, PageKind};
pub use page_replacement::{ClockEviction, PageReplacementPolicy};
pub use swapping::{SwapSlot, SwapSpace};
pub use virtual_memory::VirtualMemory;
pub use vm_error::{VmError, VmResult};
pub use vma::{MapId, MmapRegion};
