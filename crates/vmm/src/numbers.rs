//! Page and frame number types.
//!
//! A [`PageNumber`] names a virtual page of an address space; a [`FrameNumber`] names a
//! physical frame of main memory. Page tables map the former to the latter.

use crate::{PAGE_SIZE, address::PhysicalAddress};
use core::fmt;

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed; frame `n` covers the `PAGE_SIZE` bytes of main memory\n\
     starting at `n * PAGE_SIZE`."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_SIZE)
    }

    /// Returns the physical address at the end of this frame (start of next frame).
    #[inline]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 + 1) * PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page numbers are zero-indexed and double as indexes into a flat page table."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bounds() {
        let frame = FrameNumber::new(3);
        assert_eq!(frame.start(), PhysicalAddress::new(3 * PAGE_SIZE));
        assert_eq!(frame.end(), PhysicalAddress::new(4 * PAGE_SIZE));
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{:?}", FrameNumber::new(12)), "FrameNumber(12)");
        assert_eq!(format!("{}", PageNumber::new(12)), "12");
    }
}
