//! Demand-paged virtual memory for a teaching kernel: a frame table with clock eviction, a
//! swap space on a block device, lazily loaded page descriptors and memory-mapped files.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod user_program;
