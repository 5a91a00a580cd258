//! Registry of file mappings created by `mmap`.

use crate::{
    fs::FileHandle,
    mem::page::PageId,
    mem::vm_error::{VmError, VmResult},
    paging::Asid,
    sync::Mutex,
};
use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;
use vmm_shared::mem::VirtAddr;

/// Mapping identifier, unique across address spaces for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub(crate) u32);

impl MapId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Clone)]
pub struct MmapRegion {
    pub id: MapId,
    pub asid: Asid,
    pub file: FileHandle,
    pub start: VirtAddr,
    /// One past the last mapped page.
    pub end: VirtAddr,
    /// Bytes of the file mapped, the tail of the last page being zero.
    pub length: usize,
    /// Descriptors of the region's pages, in address order.
    pub pages: Vec<PageId>,
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("id", &self.id)
            .field("asid", &self.asid)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Mappings {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: u32,
}

#[derive(Default)]
pub struct MmapTable {
    mappings: Mutex<Mappings>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a region under a fresh id.
    pub fn insert(&self, region: impl FnOnce(MapId) -> MmapRegion) -> MapId {
        let mut mappings = self.mappings.lock();
        let id = MapId(mappings.next_id);
        mappings.next_id += 1;
        mappings.regions.insert(id, region(id));
        id
    }

    /// Removes the region `id` of `asid`. Ids owned by other address spaces are unknown.
    pub fn remove(&self, asid: Asid, id: MapId) -> VmResult<MmapRegion> {
        let mut mappings = self.mappings.lock();
        match mappings.regions.get(&id) {
            Some(region) if region.asid == asid => {}
            _ => return Err(VmError::UnknownMapping(id)),
        }
        mappings
            .regions
            .remove(&id)
            .ok_or(VmError::UnknownMapping(id))
    }

    pub fn get(&self, asid: Asid, id: MapId) -> Option<MmapRegion> {
        self.mappings
            .lock()
            .regions
            .get(&id)
            .filter(|region| region.asid == asid)
            .cloned()
    }

    /// Ids of every mapping owned by `asid`, oldest first.
    pub fn ids_for(&self, asid: Asid) -> Vec<MapId> {
        self.mappings
            .lock()
            .regions
            .values()
            .filter(|region| region.asid == asid)
            .map(|region| region.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use alloc::{sync::Arc, vec};

    fn region(id: MapId, asid: Asid) -> MmapRegion {
        MmapRegion {
            id,
            asid,
            file: Arc::new(MemFile::new(vec![0; 10])),
            start: VirtAddr::new(0x1000_0000),
            end: VirtAddr::new(0x1000_1000),
            length: 10,
            pages: Vec::new(),
        }
    }

    #[test]
    fn ids_are_per_owner() {
        let table = MmapTable::new();
        let a = table.insert(|id| region(id, 1));
        let b = table.insert(|id| region(id, 2));
        let c = table.insert(|id| region(id, 1));
        assert_ne!(a, b);
        assert_eq!(table.ids_for(1), [a, c]);
        assert_eq!(table.ids_for(2), [b]);
        assert!(table.get(2, a).is_none());
    }

    #[test]
    fn remove_checks_owner() {
        let table = MmapTable::new();
        let id = table.insert(|id| region(id, 1));
        assert_eq!(table.remove(2, id).err(), Some(VmError::UnknownMapping(id)));
        assert_eq!(table.remove(1, id).unwrap().id, id);
        assert!(table.remove(1, id).is_err());
        assert!(table.ids_for(1).is_empty());
    }
}
