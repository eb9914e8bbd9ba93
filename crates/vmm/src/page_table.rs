//! Flat, single-level page tables.
//!
//! Virtual page `i` is described by entry `i`. A table is shared between its owning
//! address space and the machine while installed, so it is handed around as a
//! [`SharedPageTable`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::{FrameNumber, PageNumber, TranslationEntry};

/// A flat page table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTable {
    entries: Vec<TranslationEntry>,
}

impl PageTable {
    /// Creates a table mapping virtual page `i` to `frames[i]`.
    ///
    /// Every entry is valid and writable, with the use and dirty bits clear.
    pub fn from_frames(frames: &[FrameNumber]) -> Self {
        let entries = frames
            .iter()
            .enumerate()
            .map(|(page, &frame)| TranslationEntry::new(PageNumber::new(page), frame))
            .collect();
        Self { entries }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for a virtual page, if the table covers it.
    pub fn entry(&self, page: PageNumber) -> Option<&TranslationEntry> {
        self.entries.get(page.as_usize())
    }

    /// Returns the mutable entry for a virtual page, if the table covers it.
    pub fn entry_mut(&mut self, page: PageNumber) -> Option<&mut TranslationEntry> {
        self.entries.get_mut(page.as_usize())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TranslationEntry> {
        self.entries.iter_mut()
    }

    /// Returns the frames referenced by valid entries, in virtual page order.
    pub fn frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.is_valid())
            .map(TranslationEntry::physical_page)
    }
}

/// A page table shared between an address space and the machine.
///
/// Cloning the handle does not copy the table.
#[derive(Debug, Clone)]
pub struct SharedPageTable(Arc<Mutex<PageTable>>);

impl SharedPageTable {
    pub fn new(table: PageTable) -> Self {
        Self(Arc::new(Mutex::new(table)))
    }

    /// Locks the table for reading or updating entries.
    pub fn lock(&self) -> MutexGuard<'_, PageTable> {
        self.0.lock()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns true if both handles refer to the same table.
    pub fn ptr_eq(&self, other: &SharedPageTable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<PageTable> for SharedPageTable {
    fn from(table: PageTable) -> Self {
        Self::new(table)
    }
}
