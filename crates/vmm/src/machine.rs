//! The simulated machine: main memory, the register file and the MMU.
//!
//! The machine is a scale model of a 32-bit MIPS workstation. Main memory is a flat byte
//! array divided into `PAGE_SIZE` frames, and every user memory access is translated
//! through whichever page table is currently installed. Words are stored little-endian.

use alloc::boxed::Box;
use core::fmt;

use crate::registers::{BAD_VADDR_REG, NUM_TOTAL_REGS};
use crate::{
    FrameNumber, PhysicalAddress, PhysicalMemoryManager, SharedPageTable, VirtualAddress,
};

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: usize = 128;

/// Default number of physical frames.
pub const NUM_PHYS_PAGES: usize = 32;

/// Default size of a user program's stack, in bytes.
pub const USER_STACK_SIZE: usize = 1024;

/// Geometry of a simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of physical frames of main memory.
    pub num_phys_pages: usize,
    /// Bytes of stack given to every user program.
    pub user_stack_size: usize,
}

impl MachineConfig {
    /// Returns the size of main memory in bytes.
    pub const fn memory_size(&self) -> usize {
        self.num_phys_pages * PAGE_SIZE
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: NUM_PHYS_PAGES,
            user_stack_size: USER_STACK_SIZE,
        }
    }
}

/// Exceptions raised by address translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Unaligned access, or a virtual page beyond the end of the page table.
    AddressError(VirtualAddress),
    /// The page table entry is not valid.
    PageFault(VirtualAddress),
    /// A write to a read-only page.
    ReadOnly(VirtualAddress),
    /// The translation produced a frame outside main memory.
    BusError(VirtualAddress),
}

impl Exception {
    /// Returns the virtual address that caused the exception.
    pub const fn address(&self) -> VirtualAddress {
        match self {
            Exception::AddressError(addr)
            | Exception::PageFault(addr)
            | Exception::ReadOnly(addr)
            | Exception::BusError(addr) => *addr,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::AddressError(addr) => write!(f, "address error at {addr}"),
            Exception::PageFault(addr) => write!(f, "page fault at {addr}"),
            Exception::ReadOnly(addr) => write!(f, "write to read-only page at {addr}"),
            Exception::BusError(addr) => write!(f, "bus error at {addr}"),
        }
    }
}

impl core::error::Error for Exception {}

/// A simulated single-CPU machine.
pub struct Machine {
    config: MachineConfig,
    registers: [u32; NUM_TOTAL_REGS],
    memory: Box<[u8]>,
    page_table: Option<SharedPageTable>,
}

impl Machine {
    /// Creates a machine with zeroed memory and registers and no page table installed.
    pub fn new(config: MachineConfig) -> Self {
        log::debug!(
            "creating machine with {} frames of {} bytes",
            config.num_phys_pages,
            PAGE_SIZE
        );
        Self {
            config,
            registers: [0; NUM_TOTAL_REGS],
            memory: alloc::vec![0u8; config.memory_size()].into_boxed_slice(),
            page_table: None,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Asserts that every frame `pmm` can hand out exists in main memory.
    pub(crate) fn check_allocator(&self, pmm: &PhysicalMemoryManager) {
        assert!(
            pmm.total_frames() <= self.config.num_phys_pages,
            "allocator tracks {} frames but the machine has {}",
            pmm.total_frames(),
            self.config.num_phys_pages
        );
    }

    /// Returns the whole of main memory.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Returns the whole of main memory, mutably.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Returns the bytes of one physical frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame lies outside main memory.
    pub fn frame(&self, frame: FrameNumber) -> &[u8] {
        &self.memory[frame.start().as_usize()..frame.end().as_usize()]
    }

    /// Returns the bytes of one physical frame, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the frame lies outside main memory.
    pub fn frame_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        &mut self.memory[frame.start().as_usize()..frame.end().as_usize()]
    }

    /// Reads a register.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a register number.
    pub fn read_register(&self, index: usize) -> u32 {
        self.registers[index]
    }

    /// Writes a register.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a register number.
    pub fn write_register(&mut self, index: usize, value: u32) {
        self.registers[index] = value;
    }

    /// Returns the whole register file.
    pub fn registers(&self) -> &[u32; NUM_TOTAL_REGS] {
        &self.registers
    }

    /// Makes `table` the page table used for all subsequent translations.
    pub fn install_page_table(&mut self, table: SharedPageTable) {
        self.page_table = Some(table);
    }

    /// Returns the currently installed page table.
    pub fn installed_page_table(&self) -> Option<&SharedPageTable> {
        self.page_table.as_ref()
    }

    /// Removes `table` from the machine if it is the one currently installed.
    ///
    /// Returns true if the table was installed.
    pub fn uninstall_page_table(&mut self, table: &SharedPageTable) -> bool {
        match &self.page_table {
            Some(installed) if installed.ptr_eq(table) => {
                self.page_table = None;
                true
            }
            _ => false,
        }
    }

    /// Translates a virtual address through the installed page table.
    ///
    /// `size` is the width of the access (1, 2 or 4 bytes) and must be naturally aligned.
    /// On success the entry's use bit is set, and its dirty bit too when `writing`.
    ///
    /// # Panics
    ///
    /// Panics if no page table is installed.
    pub fn translate(
        &self,
        addr: VirtualAddress,
        size: usize,
        writing: bool,
    ) -> Result<PhysicalAddress, Exception> {
        if (size == 4 && !addr.is_aligned(4)) || (size == 2 && !addr.is_aligned(2)) {
            log::trace!("unaligned access of {size} bytes at {addr}");
            return Err(Exception::AddressError(addr));
        }

        let table = self
            .page_table
            .as_ref()
            .expect("translation requires an installed page table");
        let mut table = table.lock();

        let page = addr.page_number();
        let entry = table.entry_mut(page).ok_or_else(|| {
            log::trace!("virtual page {page} beyond end of page table");
            Exception::AddressError(addr)
        })?;

        if !entry.is_valid() {
            return Err(Exception::PageFault(addr));
        }
        if writing && entry.flags().is_read_only() {
            return Err(Exception::ReadOnly(addr));
        }

        let frame = entry.physical_page();
        if frame.as_usize() >= self.config.num_phys_pages {
            log::trace!("frame {frame} beyond end of main memory");
            return Err(Exception::BusError(addr));
        }

        let flags = entry.flags_mut();
        flags.set_used(true);
        if writing {
            flags.set_dirty(true);
        }

        Ok(frame.start() + addr.page_offset())
    }

    /// Reads 1, 2 or 4 bytes of virtual memory.
    ///
    /// On an exception the faulting address is latched in the bad-address register.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not 1, 2 or 4, or if no page table is installed.
    pub fn read_mem(&mut self, addr: VirtualAddress, size: usize) -> Result<u32, Exception> {
        assert!(matches!(size, 1 | 2 | 4), "invalid access size {size}");

        let phys = self.translate(addr, size, false).inspect_err(|e| self.raise(e))?;
        let bytes = &self.memory[phys.as_usize()..phys.as_usize() + size];

        Ok(match size {
            1 => u32::from(bytes[0]),
            2 => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        })
    }

    /// Writes the low 1, 2 or 4 bytes of `value` to virtual memory.
    ///
    /// On an exception the faulting address is latched in the bad-address register.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not 1, 2 or 4, or if no page table is installed.
    pub fn write_mem(
        &mut self,
        addr: VirtualAddress,
        size: usize,
        value: u32,
    ) -> Result<(), Exception> {
        assert!(matches!(size, 1 | 2 | 4), "invalid access size {size}");

        let phys = self.translate(addr, size, true).inspect_err(|e| self.raise(e))?;
        let bytes = value.to_le_bytes();
        self.memory[phys.as_usize()..phys.as_usize() + size].copy_from_slice(&bytes[..size]);
        Ok(())
    }

    fn raise(&mut self, exception: &Exception) {
        log::debug!("{exception}");
        self.registers[BAD_VADDR_REG] = exception.address().as_usize() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageNumber, PageTable};

    fn machine_with_table(frames: &[usize]) -> (Machine, SharedPageTable) {
        let mut machine = Machine::new(MachineConfig::default());
        let frames: alloc::vec::Vec<_> = frames.iter().copied().map(FrameNumber::new).collect();
        let table = SharedPageTable::new(PageTable::from_frames(&frames));
        machine.install_page_table(table.clone());
        (machine, table)
    }

    #[test]
    fn default_geometry() {
        let machine = Machine::new(MachineConfig::default());
        assert_eq!(machine.memory().len(), NUM_PHYS_PAGES * PAGE_SIZE);
        assert!(machine.registers().iter().all(|&r| r == 0));
        assert!(machine.installed_page_table().is_none());
    }

    #[test]
    fn translates_through_non_identity_mapping() {
        let (machine, _) = machine_with_table(&[5, 2]);

        assert_eq!(
            machine.translate(VirtualAddress::new(4), 4, false),
            Ok(PhysicalAddress::new(5 * PAGE_SIZE + 4))
        );
        assert_eq!(
            machine.translate(VirtualAddress::new(PAGE_SIZE + 9), 1, false),
            Ok(PhysicalAddress::new(2 * PAGE_SIZE + 9))
        );
    }

    #[test]
    fn translation_sets_use_and_dirty() {
        let (machine, table) = machine_with_table(&[3, 4]);

        machine.translate(VirtualAddress::new(0), 4, false).unwrap();
        machine
            .translate(VirtualAddress::new(PAGE_SIZE), 4, true)
            .unwrap();

        let table = table.lock();
        let first = table.entry(PageNumber::new(0)).unwrap().flags();
        let second = table.entry(PageNumber::new(1)).unwrap().flags();
        assert!(first.is_used() && !first.is_dirty());
        assert!(second.is_used() && second.is_dirty());
    }

    #[test]
    fn translation_exceptions() {
        let (machine, table) = machine_with_table(&[1, 40]);
        table
            .lock()
            .entry_mut(PageNumber::new(0))
            .unwrap()
            .flags_mut()
            .set_read_only(true);

        let unaligned = VirtualAddress::new(2);
        assert_eq!(
            machine.translate(unaligned, 4, false),
            Err(Exception::AddressError(unaligned))
        );

        let beyond = VirtualAddress::new(2 * PAGE_SIZE);
        assert_eq!(
            machine.translate(beyond, 1, false),
            Err(Exception::AddressError(beyond))
        );

        let read_only = VirtualAddress::new(8);
        assert!(machine.translate(read_only, 4, false).is_ok());
        assert_eq!(
            machine.translate(read_only, 4, true),
            Err(Exception::ReadOnly(read_only))
        );

        let bus = VirtualAddress::new(PAGE_SIZE);
        assert_eq!(
            machine.translate(bus, 4, false),
            Err(Exception::BusError(bus))
        );

        table.lock().entry_mut(PageNumber::new(0)).unwrap().invalidate();
        let fault = VirtualAddress::new(0);
        assert_eq!(
            machine.translate(fault, 4, false),
            Err(Exception::PageFault(fault))
        );
    }

    #[test]
    #[should_panic(expected = "installed page table")]
    fn translation_without_table_panics() {
        let machine = Machine::new(MachineConfig::default());
        let _ = machine.translate(VirtualAddress::new(0), 4, false);
    }

    #[test]
    fn memory_round_trip_is_little_endian() {
        let (mut machine, _) = machine_with_table(&[6]);

        machine
            .write_mem(VirtualAddress::new(8), 4, 0x1122_3344)
            .unwrap();
        assert_eq!(
            &machine.frame(FrameNumber::new(6))[8..12],
            &[0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(machine.read_mem(VirtualAddress::new(8), 4), Ok(0x1122_3344));
        assert_eq!(machine.read_mem(VirtualAddress::new(8), 2), Ok(0x3344));
        assert_eq!(machine.read_mem(VirtualAddress::new(11), 1), Ok(0x11));

        machine.write_mem(VirtualAddress::new(9), 1, 0xAB).unwrap();
        assert_eq!(machine.read_mem(VirtualAddress::new(8), 4), Ok(0x1122_AB44));
    }

    #[test]
    fn faults_latch_bad_address() {
        let (mut machine, _) = machine_with_table(&[0]);
        let addr = VirtualAddress::new(PAGE_SIZE + 4);

        assert_eq!(machine.read_mem(addr, 4), Err(Exception::AddressError(addr)));
        assert_eq!(
            machine.read_register(BAD_VADDR_REG),
            addr.as_usize() as u32
        );
    }

    #[test]
    fn uninstalls_only_matching_table() {
        let (mut machine, table) = machine_with_table(&[0]);
        let other = SharedPageTable::new(PageTable::default());

        assert!(!machine.uninstall_page_table(&other));
        assert!(machine.installed_page_table().is_some());
        assert!(machine.uninstall_page_table(&table));
        assert!(machine.installed_page_table().is_none());
    }
}
