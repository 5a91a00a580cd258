// https://wiki.osdev.org/Paging

// Frame numbers are 20 bits wide on the 32-bit platforms we target, so the
// usize -> u32 casts below cannot truncate a valid frame number.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{PhysAddr, VirtAddr};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user entry mapping `frame`.
    pub fn user_mapping(frame: PhysAddr, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame.frame_number() as u32))
    }

    pub fn frame(&self) -> PhysAddr {
        PhysAddr::from_frame_number(self.page_frame_address().value() as usize)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl From<VirtAddr> for VirtualAddress {
    fn from(addr: VirtAddr) -> Self {
        Self::new_with_raw_value(addr.as_usize() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mapping_bits() {
        let entry = PageTableEntry::user_mapping(PhysAddr::new(0x0010_3000), true);
        assert!(entry.present());
        assert!(entry.read_write());
        assert!(entry.user_supervisor());
        assert!(!entry.accessed());
        assert!(!entry.dirty());
        assert_eq!(entry.frame(), PhysAddr::new(0x0010_3000));

        let entry = entry.with_dirty(true).with_accessed(true);
        assert_eq!(entry.raw_value() & 0x60, 0x60);
    }

    #[test]
    fn split_virtual_address() {
        let addr = VirtualAddress::from(VirtAddr::new(0x0804_8123));
        assert_eq!(addr.page_directory_index().value(), 0x20);
        assert_eq!(addr.page_table_index().value(), 0x48);
        assert_eq!(addr.offset().value(), 0x123);
    }
}
