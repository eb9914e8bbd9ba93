//! Translation entries: the rows of a page table.

use crate::{FrameNumber, PageNumber};

/// Status and permission bits of a translation entry.
///
/// `USE` and `DIRTY` are maintained by the machine on every successful translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// Valid bit (bit 0).
    const VALID: u8 = 1 << 0;

    /// Read-only bit (bit 1).
    const READ_ONLY: u8 = 1 << 1;

    /// Use bit (bit 2), set when the page is referenced.
    const USE: u8 = 1 << 2;

    /// Dirty bit (bit 3), set when the page is written.
    const DIRTY: u8 = 1 << 3;

    /// Creates empty flags (entry not valid).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw flag bits.
    pub const fn to_raw(self) -> u8 {
        self.0
    }

    #[inline]
    const fn get(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub const fn is_valid(self) -> bool {
        self.get(Self::VALID)
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.set(Self::VALID, valid);
    }

    pub const fn is_read_only(self) -> bool {
        self.get(Self::READ_ONLY)
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.set(Self::READ_ONLY, read_only);
    }

    pub const fn is_used(self) -> bool {
        self.get(Self::USE)
    }

    pub fn set_used(&mut self, used: bool) {
        self.set(Self::USE, used);
    }

    pub const fn is_dirty(self) -> bool {
        self.get(Self::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(Self::DIRTY, dirty);
    }
}

/// One page table row, mapping a virtual page to a physical frame.
///
/// A valid entry always names a frame that is allocated to the entry's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    virtual_page: PageNumber,
    physical_page: FrameNumber,
    flags: EntryFlags,
}

impl TranslationEntry {
    /// Creates a valid, writable entry with the use and dirty bits clear.
    pub fn new(virtual_page: PageNumber, physical_page: FrameNumber) -> Self {
        let mut flags = EntryFlags::empty();
        flags.set_valid(true);
        Self {
            virtual_page,
            physical_page,
            flags,
        }
    }

    pub const fn virtual_page(&self) -> PageNumber {
        self.virtual_page
    }

    pub const fn physical_page(&self) -> FrameNumber {
        self.physical_page
    }

    pub const fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut EntryFlags {
        &mut self.flags
    }

    pub const fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }

    /// Marks the entry invalid. The frame number is kept for diagnostics only.
    pub fn invalidate(&mut self) {
        self.flags.set_valid(false);
    }
}
