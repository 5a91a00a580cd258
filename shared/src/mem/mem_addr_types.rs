//! Strongly typed physical and virtual addresses.

use super::PAGE_FRAME_SIZE;
use core::fmt;

macro_rules! address_types {
    ($($(#[$meta:meta])* $name:ident),*) => {
        $(
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            pub const fn as_usize(self) -> usize {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Offset of this address within its page.
            pub const fn page_offset(self) -> usize {
                self.0 % PAGE_FRAME_SIZE
            }

            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }

            /// The address of the start of the page containing this address.
            pub const fn page_round_down(self) -> Self {
                Self(self.0 - self.page_offset())
            }

            pub const fn checked_add(self, bytes: usize) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({:#X})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }
        )*
    };
}

address_types!(
    /// An address in a user (or kernel) address space.
    VirtAddr,
    /// An address of physical memory.
    PhysAddr
);

impl PhysAddr {
    /// Number of the frame containing this address.
    pub const fn frame_number(self) -> usize {
        self.0 / PAGE_FRAME_SIZE
    }

    pub const fn from_frame_number(frame: usize) -> Self {
        Self(frame * PAGE_FRAME_SIZE)
    }
}

impl VirtAddr {
    /// Number of the virtual page containing this address.
    pub const fn page_number(self) -> usize {
        self.0 / PAGE_FRAME_SIZE
    }
}
