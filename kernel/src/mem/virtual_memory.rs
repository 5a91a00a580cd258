//! Demand paging for user address spaces.
//!
//! [`VirtualMemory`] owns the frame table, swap space, descriptor arena and mmap registry. Pages
//! are described up front (stack growth, segment staging, `mmap`) and only get a frame when
//! they are loaded, either by a fault or by a kernel copy to or from user memory. When the
//! pool runs dry a victim frame is claimed, its pages are written to their file or to swap, and
//! the frame goes straight to the thread that needed it.
//!
//! Locks are taken in this order: page, arena, eviction, frame table, then the MMU, frame
//! memory, swap and files. A thread that finds a page's frame claimed by an eviction drops the
//! page lock and retries; by then the page is unloaded.

use crate::{
    fs::FileHandle,
    mem::{
        frame_allocator::{AllocFlags, FramePool},
        frame_table::{FrameMapping, FramePin, FrameTable},
        page::{Backing, Page, PageId, PageInfo, PageRef, PageStore},
        page_replacement::{ClockEviction, PageReplacementPolicy},
        swapping::SwapSpace,
        vma::{MapId, MmapRegion, MmapTable},
        vm_error::{VmError, VmResult},
    },
    paging::{Asid, Mmu},
    sync::MutexGuard,
};
use alloc::{boxed::Box, vec::Vec};
use core::hint::spin_loop;
use log::{debug, trace};
use vmm_shared::mem::{PhysAddr, VirtAddr, MAX_STACK_SIZE, OFFSET, PAGE_FRAME_SIZE, STACK_SLACK};

pub struct VirtualMemory<M: Mmu> {
    mmu: M,
    frames: FrameTable,
    swap: SwapSpace,
    pages: PageStore,
    mmaps: MmapTable,
}

impl<M: Mmu> VirtualMemory<M> {
    /// A manager using clock replacement.
    pub fn new(mmu: M, pool: FramePool, swap: SwapSpace) -> Self {
        Self::with_policy(mmu, pool, swap, Box::new(ClockEviction::new()))
    }

    pub fn with_policy(
        mmu: M,
        pool: FramePool,
        swap: SwapSpace,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        Self {
            mmu,
            frames: FrameTable::new(pool, policy),
            swap,
            pages: PageStore::new(),
            mmaps: MmapTable::new(),
        }
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Number of live page descriptors across all address spaces.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn check_user_page(vaddr: VirtAddr) -> VmResult<()> {
        if vaddr.is_null() {
            return Err(VmError::NullAddress);
        }
        if !vaddr.is_page_aligned() {
            return Err(VmError::Misaligned(vaddr));
        }
        if vaddr.as_usize() >= OFFSET {
            return Err(VmError::BadAddress(vaddr));
        }
        Ok(())
    }

    // Descriptors -------------------------------------------------------------

    /// Describes the user page at `vaddr`, unloaded. Fails if the page is already described.
    ///
    /// Swap backing cannot be requested: pages only move to swap by being unloaded.
    pub fn new_page(
        &self,
        asid: Asid,
        vaddr: VirtAddr,
        writable: bool,
        backing: Backing,
    ) -> VmResult<PageId> {
        Self::check_user_page(vaddr)?;
        match &backing {
            Backing::Swap { .. } => {
                return Err(VmError::InvalidBacking("swap pages only come from unloading"))
            }
            Backing::File {
                read_bytes,
                zero_bytes,
                ..
            } if read_bytes.checked_add(*zero_bytes) != Some(PAGE_FRAME_SIZE) => {
                return Err(VmError::InvalidBacking(
                    "file page must cover exactly one page",
                ))
            }
            _ => {}
        }

        let page = Page {
            asid,
            vaddr,
            writable,
            backing,
            frame: None,
        };
        self.pages.insert_with(
            page,
            || match self.mmu.lookup_side_table(asid, vaddr) {
                Some(_) => Err(VmError::AlreadyMapped(vaddr)),
                None => Ok(()),
            },
            |id| self.mmu.attach_side_table(asid, vaddr, Some(id)),
        )
    }

    /// The descriptor of the page containing `vaddr`.
    pub fn find_page(&self, asid: Asid, vaddr: VirtAddr) -> Option<PageId> {
        self.mmu.lookup_side_table(asid, vaddr.page_round_down())
    }

    pub fn page_info(&self, id: PageId) -> VmResult<PageInfo> {
        Ok(self.pages.get(id)?.lock().info())
    }

    /// Locks `page_ref` and, if the page is loaded, pins its frame. Backs off while the frame
    /// is claimed by an eviction, which will leave the page unloaded.
    fn lock_pinned<'p>(
        &self,
        page_ref: &'p PageRef,
    ) -> (MutexGuard<'p, Page>, Option<FramePin<'_>>) {
        loop {
            let page = page_ref.lock();
            let Some(paddr) = page.frame else {
                return (page, None);
            };
            if let Some(pin) = self.frames.try_pin(paddr) {
                return (page, Some(pin));
            }
            drop(page);
            spin_loop();
        }
    }

    // Load and unload ---------------------------------------------------------

    /// Brings a page into a frame. With `hold` the frame stays pinned after the call; release
    /// it with [`VirtualMemory::unpin_frame`].
    pub fn load(&self, id: PageId, hold: bool) -> VmResult<PhysAddr> {
        let page_ref = self.pages.get(id)?;
        let mut page = page_ref.lock();
        let pin = self.load_locked(id, &mut page)?;
        Ok(if hold { pin.leak() } else { pin.paddr() })
    }

    fn load_locked(&self, id: PageId, page: &mut Page) -> VmResult<FramePin<'_>> {
        if page.is_loaded() {
            return Err(VmError::AlreadyLoaded(page.vaddr));
        }
        let (asid, vaddr) = (page.asid, page.vaddr);

        // On error the pin drops with no page attached, which returns the frame to the pool.
        let pin = self.frames.allocate(AllocFlags::USER, || self.evict())?;
        let paddr = pin.paddr();

        let swapped_from = match &page.backing {
            Backing::Zero => {
                self.frames.with_frame(paddr, |mem| mem.fill(0));
                None
            }
            Backing::File {
                file,
                offset,
                read_bytes,
                ..
            } => {
                let actual = self.frames.with_frame(paddr, |mem| {
                    let (read, zero) = mem.split_at_mut(*read_bytes);
                    zero.fill(0);
                    file.read_at(*offset, read)
                });
                if actual != *read_bytes {
                    return Err(VmError::ShortRead {
                        vaddr,
                        expected: *read_bytes,
                        actual,
                    });
                }
                None
            }
            Backing::Swap { slot: Some(slot) } => {
                self.frames
                    .with_frame(paddr, |mem| self.swap.read(*slot, mem))?;
                Some(*slot)
            }
            Backing::Swap { slot: None } => {
                panic!("unloaded page {vaddr} of address space {asid} has no swap slot")
            }
        };

        self.frames.attach(
            paddr,
            FrameMapping {
                page: id,
                asid,
                vaddr,
            },
        );
        if !self.mmu.install_mapping(asid, vaddr, paddr, page.writable) {
            self.frames.detach(paddr, id);
            return Err(VmError::MappingFailed(vaddr));
        }
        if let Some(slot) = swapped_from {
            self.swap.free(slot);
            page.backing = Backing::Swap { slot: None };
        }
        self.mmu.set_dirty(asid, vaddr, false);
        self.mmu.set_accessed(asid, vaddr, true);
        page.frame = Some(paddr);

        trace!("loaded {vaddr} of address space {asid} into {paddr}");
        Ok(pin)
    }

    /// Writes a page out to its file or to swap and takes it out of its frame.
    pub fn unload(&self, id: PageId) -> VmResult<()> {
        let page_ref = self.pages.get(id)?;
        let (mut page, pin) = self.lock_pinned(&page_ref);
        let Some(pin) = pin else {
            return Err(VmError::NotLoaded(page.vaddr));
        };
        self.unload_locked(id, &mut page, pin.paddr());
        Ok(())
    }

    /// The caller holds a pin on `paddr`, the page's frame.
    fn unload_locked(&self, id: PageId, page: &mut Page, paddr: PhysAddr) {
        let (asid, vaddr) = (page.asid, page.vaddr);
        let dirty = self.mmu.is_dirty(asid, vaddr);
        self.mmu.clear_mapping(asid, vaddr);

        let keeps_file_backing = match &page.backing {
            Backing::File { .. } if dirty => self.write_back(page, paddr),
            Backing::File { .. } => true,
            // Clean zero pages are swapped too, so a reloaded zero page is always swap backed.
            Backing::Zero | Backing::Swap { .. } => false,
        };
        if !keeps_file_backing {
            let slot = self
                .frames
                .with_frame(paddr, |mem| self.swap.swap_out(mem))
                .unwrap_or_else(|e| {
                    panic!("cannot swap out {vaddr} of address space {asid}: {e}")
                });
            trace!("{vaddr} of address space {asid} swapped to {slot:?}");
            page.backing = Backing::Swap { slot: Some(slot) };
        }

        page.frame = None;
        self.frames.detach(paddr, id);
    }

    /// Writes a file page's frame back to the file. Returns false if the page is not file
    /// backed or the file denies writes.
    fn write_back(&self, page: &Page, paddr: PhysAddr) -> bool {
        let Backing::File {
            file,
            offset,
            read_bytes,
            ..
        } = &page.backing
        else {
            return false;
        };
        if file.is_deny_write() {
            return false;
        }
        let written = self
            .frames
            .with_frame(paddr, |mem| file.write_at(*offset, &mem[..*read_bytes]));
        assert_eq!(
            written, *read_bytes,
            "short write-back of {} in address space {}",
            page.vaddr, page.asid
        );
        trace!("wrote back {} of address space {}", page.vaddr, page.asid);
        true
    }

    /// Claims a victim frame and unloads its pages. Runs with the requesting page's lock held,
    /// which is never one of the victim's pages since those are loaded.
    fn evict(&self) -> VmResult<PhysAddr> {
        let (victim, pages) = self.frames.select_victim(&self.mmu)?;
        for mapping in &pages {
            let Ok(page_ref) = self.pages.get(mapping.page) else {
                continue;
            };
            let mut page = page_ref.lock();
            // Freed and possibly reused since the claim.
            if page.frame == Some(victim) {
                self.unload_locked(mapping.page, &mut page, victim);
            }
        }
        Ok(victim)
    }

    /// Discards a page: no write-back, its swap slot (if any) is released.
    pub fn free(&self, id: PageId) -> VmResult<()> {
        self.destroy(id, false)
    }

    fn destroy(&self, id: PageId, flush: bool) -> VmResult<()> {
        let page_ref = self.pages.get(id)?;
        let (mut page, pin) = self.lock_pinned(&page_ref);
        if !self.pages.remove(id, &page_ref) {
            return Err(VmError::UnknownPage(id));
        }
        let (asid, vaddr) = (page.asid, page.vaddr);

        if let Some(pin) = pin {
            let dirty = self.mmu.is_dirty(asid, vaddr);
            self.mmu.clear_mapping(asid, vaddr);
            if flush && dirty {
                self.write_back(&page, pin.paddr());
            }
            page.frame = None;
            self.frames.detach(pin.paddr(), id);
        }
        if let Backing::Swap { slot: Some(slot) } = page.backing {
            self.swap.free(slot);
            page.backing = Backing::Swap { slot: None };
        }
        self.mmu.attach_side_table(asid, vaddr, None);
        Ok(())
    }

    // Pinning -----------------------------------------------------------------

    /// Loads the page containing `vaddr` if needed and pins its frame for the life of the
    /// returned guard.
    pub fn pin_page(&self, asid: Asid, vaddr: VirtAddr) -> VmResult<FramePin<'_>> {
        self.pin_user_page(asid, vaddr.page_round_down(), false)
    }

    /// Pins a frame, unless it is not in use or is being evicted.
    pub fn pin_frame(&self, paddr: PhysAddr) -> Option<FramePin<'_>> {
        self.frames.try_pin(paddr)
    }

    /// Releases a pin kept with `hold` or [`FramePin::leak`].
    pub fn unpin_frame(&self, paddr: PhysAddr) {
        self.frames.unpin(paddr);
    }

    fn pin_user_page(&self, asid: Asid, upage: VirtAddr, write: bool) -> VmResult<FramePin<'_>> {
        let id = self
            .find_page(asid, upage)
            .ok_or(VmError::SegmentationFault(upage))?;
        let page_ref = self
            .pages
            .get(id)
            .map_err(|_| VmError::SegmentationFault(upage))?;
        let (mut page, pin) = self.lock_pinned(&page_ref);
        if write && !page.writable {
            return Err(VmError::ReadOnly(upage));
        }
        match pin {
            Some(pin) => Ok(pin),
            None => self.load_locked(id, &mut page),
        }
    }

    // Faults and user memory --------------------------------------------------

    /// Describes and loads a zero page for the stack at the page containing `vaddr`.
    pub fn grow_stack(&self, asid: Asid, vaddr: VirtAddr) -> VmResult<PageId> {
        let upage = vaddr.page_round_down();
        let id = self.new_page(asid, upage, true, Backing::Zero)?;
        if let Err(e) = self.load(id, false) {
            self.free(id)?;
            return Err(e);
        }
        debug!("grew stack of address space {asid} to {upage}");
        Ok(id)
    }

    /// Resolves a fault at `addr`. Addresses nothing describes are treated as stack growth if
    /// they are at most `STACK_SLACK` bytes below `esp` and within `MAX_STACK_SIZE` of the top
    /// of user space.
    pub fn handle_fault(
        &self,
        asid: Asid,
        addr: VirtAddr,
        esp: VirtAddr,
        write: bool,
    ) -> VmResult<()> {
        if addr.as_usize() >= OFFSET {
            return Err(VmError::SegmentationFault(addr));
        }
        let upage = addr.page_round_down();

        let Some(id) = self.find_page(asid, upage) else {
            let near_esp = addr.as_usize() >= esp.as_usize().saturating_sub(STACK_SLACK);
            let within_limit = OFFSET - upage.as_usize() <= MAX_STACK_SIZE;
            if near_esp && within_limit {
                self.grow_stack(asid, upage)?;
                return Ok(());
            }
            return Err(VmError::SegmentationFault(addr));
        };

        let page_ref = self
            .pages
            .get(id)
            .map_err(|_| VmError::SegmentationFault(addr))?;
        let mut page = page_ref.lock();
        if write && !page.writable {
            return Err(VmError::ReadOnly(addr));
        }
        if page.is_loaded() {
            return Ok(());
        }
        self.load_locked(id, &mut page).map(drop)
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as needed.
    pub fn read_user(&self, asid: Asid, addr: VirtAddr, buf: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let vaddr = addr.checked_add(done).ok_or(VmError::BadAddress(addr))?;
            let (upage, start) = (vaddr.page_round_down(), vaddr.page_offset());
            let len = (PAGE_FRAME_SIZE - start).min(buf.len() - done);

            let pin = self.pin_user_page(asid, upage, false)?;
            self.frames.with_frame(pin.paddr(), |mem| {
                buf[done..done + len].copy_from_slice(&mem[start..start + len]);
            });
            self.mmu.set_accessed(asid, upage, true);
            drop(pin);
            done += len;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `addr`, faulting pages in as needed.
    pub fn write_user(&self, asid: Asid, addr: VirtAddr, data: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let vaddr = addr.checked_add(done).ok_or(VmError::BadAddress(addr))?;
            let (upage, start) = (vaddr.page_round_down(), vaddr.page_offset());
            let len = (PAGE_FRAME_SIZE - start).min(data.len() - done);

            let pin = self.pin_user_page(asid, upage, true)?;
            self.frames.with_frame(pin.paddr(), |mem| {
                mem[start..start + len].copy_from_slice(&data[done..done + len]);
            });
            self.mmu.set_accessed(asid, upage, true);
            self.mmu.set_dirty(asid, upage, true);
            drop(pin);
            done += len;
        }
        Ok(())
    }

    /// Describes an executable segment: `read_bytes` bytes of `file` from `offset` mapped at
    /// `upage`, then `zero_bytes` zeroes. Pages with nothing to read are zero pages.
    #[allow(clippy::too_many_arguments)]
    pub fn stage_segment(
        &self,
        asid: Asid,
        file: FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<Vec<PageId>> {
        if offset % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::InvalidBacking("segment offset is not page aligned"));
        }
        if (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::InvalidBacking(
                "segment does not end on a page boundary",
            ));
        }

        let mut staged = Vec::new();
        let (mut offset, mut read_left, mut zero_left) = (offset, read_bytes, zero_bytes);
        let mut upage = upage;
        while read_left > 0 || zero_left > 0 {
            let page_read = read_left.min(PAGE_FRAME_SIZE);
            let page_zero = PAGE_FRAME_SIZE - page_read;
            let backing = if page_read == 0 {
                Backing::Zero
            } else {
                Backing::File {
                    file: file.clone(),
                    offset,
                    read_bytes: page_read,
                    zero_bytes: page_zero,
                }
            };

            match self.new_page(asid, upage, writable, backing) {
                Ok(id) => staged.push(id),
                Err(e) => {
                    self.free_all(&staged);
                    return Err(e);
                }
            }

            offset += page_read;
            read_left -= page_read;
            zero_left -= page_zero;
            upage = upage
                .checked_add(PAGE_FRAME_SIZE)
                .ok_or(VmError::BadAddress(upage))?;
        }
        Ok(staged)
    }

    fn free_all(&self, pages: &[PageId]) {
        for &id in pages {
            if let Err(e) = self.free(id) {
                debug!("page {id:?} already gone: {e}");
            }
        }
    }

    // Memory-mapped files -----------------------------------------------------

    /// Maps the first `length` bytes of `file` at `addr`, one file page per page of the range.
    /// Nothing is read until the pages are touched.
    pub fn map(
        &self,
        asid: Asid,
        file: FileHandle,
        addr: VirtAddr,
        length: usize,
    ) -> VmResult<MapId> {
        Self::check_user_page(addr)?;
        if length == 0 {
            return Err(VmError::EmptyMapping);
        }
        let end = length
            .checked_next_multiple_of(PAGE_FRAME_SIZE)
            .and_then(|span| addr.checked_add(span))
            .filter(|end| end.as_usize() <= OFFSET)
            .ok_or(VmError::BadAddress(addr))?;

        let mut pages = Vec::new();
        for offset in (0..length).step_by(PAGE_FRAME_SIZE) {
            let read_bytes = (length - offset).min(PAGE_FRAME_SIZE);
            let backing = Backing::File {
                file: file.clone(),
                offset,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            };
            let vaddr = VirtAddr::new(addr.as_usize() + offset);
            match self.new_page(asid, vaddr, true, backing) {
                Ok(id) => pages.push(id),
                Err(e) => {
                    self.free_all(&pages);
                    return Err(e);
                }
            }
        }

        let id = self.mmaps.insert(|id| MmapRegion {
            id,
            asid,
            file,
            start: addr,
            end,
            length,
            pages,
        });
        debug!("mapped {id:?} at {addr}..{end} in address space {asid}");
        Ok(id)
    }

    /// Writes the mapping's dirty pages back to its file and removes it.
    pub fn unmap(&self, asid: Asid, id: MapId) -> VmResult<()> {
        let region = self.mmaps.remove(asid, id)?;
        for &page in &region.pages {
            if let Err(e) = self.destroy(page, true) {
                debug!("page {page:?} of {id:?} already gone: {e}");
            }
        }
        debug!("unmapped {region:?}");
        Ok(())
    }

    pub fn mapping(&self, asid: Asid, id: MapId) -> Option<MmapRegion> {
        self.mmaps.get(asid, id)
    }

    pub fn mappings(&self, asid: Asid) -> Vec<MapId> {
        self.mmaps.ids_for(asid)
    }

    /// Tears down an address space: every mapping is unmapped, then every remaining page is
    /// freed.
    pub fn exit(&self, asid: Asid) {
        for id in self.mmaps.ids_for(asid) {
            if let Err(e) = self.unmap(asid, id) {
                debug!("{id:?} already unmapped: {e}");
            }
        }
        let pages = self.mmu.side_table_entries(asid);
        let count = pages.len();
        for (_, id) in pages {
            if let Err(e) = self.free(id) {
                debug!("page {id:?} already gone: {e}");
            }
        }
        debug!("address space {asid} exited, freed {count} pages");
    }
}
