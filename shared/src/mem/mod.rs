pub mod mem_addr_types;

use crate::sizes::MB;

pub use mem_addr_types::{PhysAddr, VirtAddr};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * crate::sizes::KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks grow
// down from here.
pub const OFFSET: usize = 0x80000000;

// The user stack may not grow beyond this many bytes below OFFSET.
pub const MAX_STACK_SIZE: usize = 8 * MB;

// PUSHA may fault up to 32 bytes below the stack pointer before esp is
// updated, so such accesses still count as stack growth.
pub const STACK_SLACK: usize = 32;

// "Upper memory" (as opposed to "lower memory") starts at 1MB. Simulated frame
// pools are placed here.
pub const UPPER_MEMORY_START: usize = MB;
