//! The MMU as the memory manager sees it, and a software implementation used when the
//! manager runs on a host.

use crate::{mem::page::PageId, sync::Mutex};
use alloc::{collections::BTreeMap, vec::Vec};
use vmm_shared::{
    mem::{PhysAddr, VirtAddr, OFFSET, PAGE_FRAME_SIZE},
    paging::{PageTableEntry, VirtualAddress},
};

/// Identifies a user address space (one page directory per process).
pub type Asid = u16;

/// Hardware page-table operations plus the per-address-space side table that maps user
/// pages to their descriptors.
pub trait Mmu: Send + Sync {
    /// Maps `vaddr` to `paddr`. Returns false if the mapping could not be created.
    fn install_mapping(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        writable: bool,
    ) -> bool;
    /// Marks `vaddr` not present. Later accesses fault.
    fn clear_mapping(&self, asid: Asid, vaddr: VirtAddr);
    fn lookup_mapping(&self, asid: Asid, vaddr: VirtAddr) -> Option<PhysAddr>;

    fn is_dirty(&self, asid: Asid, vaddr: VirtAddr) -> bool;
    fn set_dirty(&self, asid: Asid, vaddr: VirtAddr, dirty: bool);
    fn is_accessed(&self, asid: Asid, vaddr: VirtAddr) -> bool;
    fn set_accessed(&self, asid: Asid, vaddr: VirtAddr, accessed: bool);

    /// Attaches `page` to `vaddr`, or detaches whatever is there when `page` is `None`.
    fn attach_side_table(&self, asid: Asid, vaddr: VirtAddr, page: Option<PageId>);
    fn lookup_side_table(&self, asid: Asid, vaddr: VirtAddr) -> Option<PageId>;
    /// Every descriptor attached in `asid`, in address order.
    fn side_table_entries(&self, asid: Asid) -> Vec<(VirtAddr, PageId)>;
}

type PageTable = BTreeMap<u16, PageTableEntry>;

#[derive(Default)]
struct SoftPageDirectory {
    tables: BTreeMap<u16, PageTable>,
    side: BTreeMap<usize, PageId>,
}

impl SoftPageDirectory {
    fn split(vaddr: VirtAddr) -> (u16, u16) {
        let addr = VirtualAddress::from(vaddr);
        (
            addr.page_directory_index().value(),
            addr.page_table_index().value(),
        )
    }

    fn entry(&self, vaddr: VirtAddr) -> Option<&PageTableEntry> {
        let (dir, table) = Self::split(vaddr);
        self.tables
            .get(&dir)
            .and_then(|t| t.get(&table))
            .filter(|e| e.present())
    }

    fn entry_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageTableEntry> {
        let (dir, table) = Self::split(vaddr);
        self.tables
            .get_mut(&dir)
            .and_then(|t| t.get_mut(&table))
            .filter(|e| e.present())
    }
}

/// Page directories kept in kernel memory. Accessed and dirty bits only change when the
/// manager (or a test standing in for the CPU) sets them.
#[derive(Default)]
pub struct SoftMmu {
    directories: Mutex<BTreeMap<Asid, SoftPageDirectory>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present mappings in `asid`.
    pub fn mapped_pages(&self, asid: Asid) -> usize {
        self.directories.lock().get(&asid).map_or(0, |dir| {
            dir.tables
                .values()
                .flat_map(|t| t.values())
                .filter(|e| e.present())
                .count()
        })
    }

    pub fn is_writable(&self, asid: Asid, vaddr: VirtAddr) -> bool {
        self.with_entry(asid, vaddr, |e| e.read_write())
    }

    fn with_entry(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        f: impl FnOnce(&PageTableEntry) -> bool,
    ) -> bool {
        self.directories
            .lock()
            .get(&asid)
            .and_then(|dir| dir.entry(vaddr))
            .is_some_and(f)
    }

    fn update_entry(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        f: impl FnOnce(PageTableEntry) -> PageTableEntry,
    ) {
        if let Some(entry) = self
            .directories
            .lock()
            .get_mut(&asid)
            .and_then(|dir| dir.entry_mut(vaddr))
        {
            *entry = f(*entry);
        }
    }
}

impl Mmu for SoftMmu {
    fn install_mapping(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        writable: bool,
    ) -> bool {
        if vaddr.as_usize() >= OFFSET || !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return false;
        }
        let (dir, table) = SoftPageDirectory::split(vaddr);
        self.directories
            .lock()
            .entry(asid)
            .or_default()
            .tables
            .entry(dir)
            .or_default()
            .insert(table, PageTableEntry::user_mapping(paddr, writable));
        true
    }

    fn clear_mapping(&self, asid: Asid, vaddr: VirtAddr) {
        let (dir, table) = SoftPageDirectory::split(vaddr);
        let mut directories = self.directories.lock();
        let Some(directory) = directories.get_mut(&asid) else {
            return;
        };
        if let Some(page_table) = directory.tables.get_mut(&dir) {
            page_table.remove(&table);
            if page_table.is_empty() {
                directory.tables.remove(&dir);
            }
        }
    }

    fn lookup_mapping(&self, asid: Asid, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.directories
            .lock()
            .get(&asid)
            .and_then(|dir| dir.entry(vaddr))
            .map(|e| e.frame())
    }

    fn is_dirty(&self, asid: Asid, vaddr: VirtAddr) -> bool {
        self.with_entry(asid, vaddr, |e| e.dirty())
    }

    fn set_dirty(&self, asid: Asid, vaddr: VirtAddr, dirty: bool) {
        self.update_entry(asid, vaddr, |e| e.with_dirty(dirty));
    }

    fn is_accessed(&self, asid: Asid, vaddr: VirtAddr) -> bool {
        self.with_entry(asid, vaddr, |e| e.accessed())
    }

    fn set_accessed(&self, asid: Asid, vaddr: VirtAddr, accessed: bool) {
        self.update_entry(asid, vaddr, |e| e.with_accessed(accessed));
    }

    fn attach_side_table(&self, asid: Asid, vaddr: VirtAddr, page: Option<PageId>) {
        let mut directories = self.directories.lock();
        let side = &mut directories.entry(asid).or_default().side;
        match page {
            Some(page) => {
                side.insert(vaddr.page_number(), page);
            }
            None => {
                side.remove(&vaddr.page_number());
            }
        }
    }

    fn lookup_side_table(&self, asid: Asid, vaddr: VirtAddr) -> Option<PageId> {
        self.directories
            .lock()
            .get(&asid)
            .and_then(|dir| dir.side.get(&vaddr.page_number()).copied())
    }

    fn side_table_entries(&self, asid: Asid) -> Vec<(VirtAddr, PageId)> {
        self.directories.lock().get(&asid).map_or_else(Vec::new, |dir| {
            dir.side
                .iter()
                .map(|(&vpn, &page)| (VirtAddr::new(vpn * PAGE_FRAME_SIZE), page))
                .collect()
        })
    }
}
