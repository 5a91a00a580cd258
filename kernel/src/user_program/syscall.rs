//! Entry points the syscall dispatcher and the page fault handler call into.
//!
//! Return values follow the user ABI: `mmap` returns a mapping id or [`MAP_FAILED`], `munmap`
//! returns 0 or -1. A fault that cannot be resolved yields the exit status the process is
//! killed with.

use crate::{
    fs::FileHandle,
    mem::{vma::MapId, virtual_memory::VirtualMemory},
    paging::{Asid, Mmu},
};
use log::{debug, warn};
use vmm_shared::mem::VirtAddr;

pub const MAP_FAILED: i32 = -1;

/// Exit status of a process killed by the kernel.
pub const EXIT_KILLED: i32 = -1;

/// Maps all of `file` at `addr`.
pub fn sys_mmap<M: Mmu>(vm: &VirtualMemory<M>, asid: Asid, file: FileHandle, addr: usize) -> i32 {
    match vm.map(asid, file.clone(), VirtAddr::new(addr), file.len()) {
        Ok(id) => i32::try_from(id.as_u32()).unwrap_or_else(|_| {
            // Ids past i32::MAX cannot be handed to user space.
            if let Err(e) = vm.unmap(asid, id) {
                warn!("cannot undo unrepresentable mapping {id:?}: {e}");
            }
            MAP_FAILED
        }),
        Err(e) => {
            debug!("mmap at {addr:#X} in address space {asid} failed: {e}");
            MAP_FAILED
        }
    }
}

pub fn sys_munmap<M: Mmu>(vm: &VirtualMemory<M>, asid: Asid, mapping: i32) -> i32 {
    let Ok(raw) = u32::try_from(mapping) else {
        return -1;
    };
    match vm.unmap(asid, MapId(raw)) {
        Ok(()) => 0,
        Err(e) => {
            debug!("munmap of {mapping} in address space {asid} failed: {e}");
            -1
        }
    }
}

/// Resolves a user page fault. On failure the caller kills the process with the returned
/// status.
pub fn page_fault<M: Mmu>(
    vm: &VirtualMemory<M>,
    asid: Asid,
    addr: usize,
    esp: usize,
    write: bool,
) -> Result<(), i32> {
    vm.handle_fault(asid, VirtAddr::new(addr), VirtAddr::new(esp), write)
        .map_err(|e| {
            warn!("killing address space {asid}: unresolved fault at {addr:#X}: {e}");
            EXIT_KILLED
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::block_core::{Block, BlockType},
        drivers::ram_disk::RamDisk,
        fs::MemFile,
        mem::{frame_allocator::FramePool, swapping::{SwapSpace, SECTORS_PER_PAGE}},
        paging::SoftMmu,
    };
    use alloc::{boxed::Box, sync::Arc, vec};
    use vmm_shared::mem::{PhysAddr, OFFSET, PAGE_FRAME_SIZE, UPPER_MEMORY_START};

    fn vm() -> VirtualMemory<SoftMmu> {
        let sectors = 4 * SECTORS_PER_PAGE;
        VirtualMemory::new(
            SoftMmu::new(),
            FramePool::new(PhysAddr::new(UPPER_MEMORY_START), 2),
            SwapSpace::new(Block::new(
                BlockType::Swap,
                "swap",
                sectors,
                Box::new(RamDisk::new(sectors)),
            )),
        )
    }

    #[test]
    fn mmap_and_munmap() {
        let vm = vm();
        let file = Arc::new(MemFile::new(vec![7; 100]));
        let id = sys_mmap(&vm, 1, file.clone(), 0x1000_0000);
        assert!(id >= 0);
        assert_eq!(sys_mmap(&vm, 1, file.clone(), 0x1000_0000), MAP_FAILED);
        assert_eq!(sys_mmap(&vm, 1, file, 0), MAP_FAILED);

        assert_eq!(sys_munmap(&vm, 2, id), -1);
        assert_eq!(sys_munmap(&vm, 1, id), 0);
        assert_eq!(sys_munmap(&vm, 1, id), -1);
        assert_eq!(sys_munmap(&vm, 1, -5), -1);
    }

    #[test]
    fn empty_file_cannot_be_mapped() {
        let vm = vm();
        let file = Arc::new(MemFile::new(vec![]));
        assert_eq!(sys_mmap(&vm, 1, file, 0x1000_0000), MAP_FAILED);
    }

    #[test]
    fn unresolvable_fault_kills() {
        let vm = vm();
        let esp = OFFSET - PAGE_FRAME_SIZE;
        assert_eq!(page_fault(&vm, 1, esp - 4, esp, true), Ok(()));
        assert_eq!(page_fault(&vm, 1, 0x1000_0000, esp, false), Err(EXIT_KILLED));
        assert_eq!(page_fault(&vm, 1, OFFSET, esp, false), Err(EXIT_KILLED));
    }
}
