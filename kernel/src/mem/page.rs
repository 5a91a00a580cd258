//! Page descriptors: what backs each user page and whether it is in a frame.

use crate::{
    fs::FileHandle,
    mem::{swapping::SwapSlot, vm_error::{VmError, VmResult}},
    paging::Asid,
    sync::Mutex,
};
use alloc::sync::Arc;
use core::fmt;
use slab::Slab;
use vmm_shared::mem::{PhysAddr, VirtAddr};

/// Handle to a descriptor in a [`PageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub(crate) usize);

/// Where a page's contents come from when it is loaded and go to when it is unloaded.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first load.
    Zero,
    /// `read_bytes` bytes of `file` at `offset`, followed by `zero_bytes` zeroes.
    File {
        file: FileHandle,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// Contents live in swap while unloaded. A loaded swap page holds no slot.
    Swap { slot: Option<SwapSlot> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Zero,
    File,
    Swap,
}

impl Backing {
    pub fn kind(&self) -> PageKind {
        match self {
            Backing::Zero => PageKind::Zero,
            Backing::File { .. } => PageKind::File,
            Backing::Swap { .. } => PageKind::Swap,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backing::Zero => write!(f, "Zero"),
            Backing::File {
                offset,
                read_bytes,
                zero_bytes,
                ..
            } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("read_bytes", read_bytes)
                .field("zero_bytes", zero_bytes)
                .finish_non_exhaustive(),
            Backing::Swap { slot } => f.debug_struct("Swap").field("slot", slot).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Page {
    pub asid: Asid,
    pub vaddr: VirtAddr,
    pub writable: bool,
    pub backing: Backing,
    /// The frame holding the page while it is loaded.
    pub frame: Option<PhysAddr>,
}

impl Page {
    pub fn is_loaded(&self) -> bool {
        self.frame.is_some()
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            asid: self.asid,
            vaddr: self.vaddr,
            writable: self.writable,
            kind: self.backing.kind(),
            frame: self.frame,
            swap_slot: match self.backing {
                Backing::Swap { slot } => slot,
                _ => None,
            },
        }
    }
}

/// A copy of a descriptor's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub asid: Asid,
    pub vaddr: VirtAddr,
    pub writable: bool,
    pub kind: PageKind,
    pub frame: Option<PhysAddr>,
    pub swap_slot: Option<SwapSlot>,
}

impl PageInfo {
    pub fn is_loaded(&self) -> bool {
        self.frame.is_some()
    }
}

pub type PageRef = Arc<Mutex<Page>>;

/// The arena of descriptors. Each descriptor has its own lock; the arena lock is only held
/// to look a handle up, never while waiting for a descriptor.
#[derive(Default)]
pub struct PageStore {
    pages: Mutex<Slab<PageRef>>,
}

impl PageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PageId) -> VmResult<PageRef> {
        self.pages
            .lock()
            .get(id.0)
            .cloned()
            .ok_or(VmError::UnknownPage(id))
    }

    pub fn insert(&self, page: Page) -> PageId {
        PageId(self.pages.lock().insert(Arc::new(Mutex::new(page))))
    }

    /// Insert while holding the arena lock, after `check` passes.
    pub fn insert_with(
        &self,
        page: Page,
        check: impl FnOnce() -> VmResult<()>,
        publish: impl FnOnce(PageId),
    ) -> VmResult<PageId> {
        let mut pages = self.pages.lock();
        check()?;
        let id = PageId(pages.insert(Arc::new(Mutex::new(page))));
        publish(id);
        Ok(id)
    }

    /// Removes `id` if it still names `page`. Returns false if the descriptor was already
    /// removed (its slot may since have been reused).
    pub fn remove(&self, id: PageId, page: &PageRef) -> bool {
        let mut pages = self.pages.lock();
        match pages.get(id.0) {
            Some(current) if Arc::ptr_eq(current, page) => {
                pages.remove(id.0);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_page(vaddr: usize) -> Page {
        Page {
            asid: 1,
            vaddr: VirtAddr::new(vaddr),
            writable: true,
            backing: Backing::Zero,
            frame: None,
        }
    }

    #[test]
    fn handles_are_revalidated() {
        let store = PageStore::new();
        let id = store.insert(zero_page(0x1000));
        let page = store.get(id).unwrap();
        assert_eq!(page.lock().vaddr, VirtAddr::new(0x1000));

        assert!(store.remove(id, &page));
        assert_eq!(store.get(id).err(), Some(VmError::UnknownPage(id)));
        assert!(!store.remove(id, &page));
        assert!(store.is_empty());
    }

    #[test]
    fn stale_handle_does_not_remove_new_page() {
        let store = PageStore::new();
        let id = store.insert(zero_page(0x1000));
        let old = store.get(id).unwrap();
        assert!(store.remove(id, &old));

        // The slab hands the slot out again.
        let reused = store.insert(zero_page(0x2000));
        assert_eq!(reused, id);
        assert!(!store.remove(id, &old));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_with_failed_check() {
        let store = PageStore::new();
        let result = store.insert_with(
            zero_page(0x1000),
            || Err(VmError::AlreadyMapped(VirtAddr::new(0x1000))),
            |_| panic!("published a rejected page"),
        );
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn info_reports_swap_slot() {
        let mut page = zero_page(0x2000);
        assert_eq!(page.info().kind, PageKind::Zero);
        assert!(!page.info().is_loaded());

        page.backing = Backing::Swap { slot: None };
        page.frame = Some(PhysAddr::new(0x10_0000));
        let info = page.info();
        assert_eq!(info.kind, PageKind::Swap);
        assert_eq!(info.swap_slot, None);
        assert!(info.is_loaded());
    }
}
