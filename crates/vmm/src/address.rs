//! Address types for the simulated machine's physical and virtual memory.
//!
//! Both address spaces are flat and byte-addressed. Physical addresses index main memory
//! directly; virtual addresses are resolved through the installed page table.

use core::fmt;
use core::ops::Add;

use crate::{PAGE_SIZE, PageNumber};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns true if the address is a multiple of `align`.
            ///
            /// `align` must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 & (align - 1) == 0
            }

            /// Returns the byte offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 % PAGE_SIZE
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical address: a byte offset into the machine's main memory."
);

impl_address_common!(
    VirtualAddress,
    "A virtual address as seen by a user program.\n\n\
     Virtual addresses are translated to physical addresses through the page table\n\
     currently installed on the machine."
);

impl VirtualAddress {
    /// Returns the virtual page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn alignment_check() {
            assert!(PhysicalAddress::new(0).is_aligned(4));
            assert!(PhysicalAddress::new(0x80).is_aligned(PAGE_SIZE));
            assert!(!PhysicalAddress::new(0x81).is_aligned(PAGE_SIZE));
            assert!(!PhysicalAddress::new(0x82).is_aligned(4));
        }

        #[test]
        fn operators() {
            let addr = PhysicalAddress::new(0x100);
            assert_eq!(addr + 0x10, PhysicalAddress::new(0x110));
            assert_eq!(addr + PAGE_SIZE, PhysicalAddress::new(0x180));
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x1a0);
            assert_eq!(format!("{addr:?}"), "PhysicalAddress(0x1a0)");
            assert_eq!(format!("{addr}"), "0x1a0");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn page_number_and_offset() {
            let addr = VirtualAddress::new(PAGE_SIZE * 2 + 7);
            assert_eq!(addr.page_number(), PageNumber::new(2));
            assert_eq!(addr.page_offset(), 7);
        }

        #[test]
        fn page_offset_at_boundary() {
            let addr = VirtualAddress::new(PAGE_SIZE);
            assert_eq!(addr.page_offset(), 0);
            assert_eq!(addr.page_number(), PageNumber::new(1));
        }

        #[test]
        fn from_u32() {
            assert_eq!(VirtualAddress::from(0x40u32), VirtualAddress::new(0x40));
        }
    }
}
