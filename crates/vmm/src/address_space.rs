//! Address space management.
//!
//! An [`AddressSpace`] is the memory image of one user process: a flat page table whose
//! entries point at frames taken from the shared [`PhysicalMemoryManager`], filled with the
//! code and data of a NOFF executable. It also owns the register pages its CPU state is
//! paged into while it is switched out.
//!
//! Teardown happens on drop: every frame goes back to the allocator, main pages first and
//! register pages second, and any linked address spaces are dropped after that.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use noff::{NoffError, Segment};

use crate::executable::{Executable, LoadPlan};
use crate::registers::{NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, RegisterPages, STACK_REG};
use crate::{
    AllocError, Exception, FrameNumber, Machine, PAGE_SIZE, PageNumber, PageTable,
    PhysicalMemoryManager, SharedPageTable, VirtualAddress,
};

/// Bytes left unused at the top of the stack, so that an off-by-one reference past the
/// initial stack pointer still lands inside the address space.
const STACK_SAFETY_MARGIN: usize = 16;

/// Address of the first instruction of every program.
const ENTRY_POINT: u32 = 0;

/// Errors that can occur while building an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSpaceError {
    /// The executable is not a NOFF image.
    Malformed(NoffError),
    /// Not enough free frames to hold the whole image.
    OutOfFrames { needed: usize, free: usize },
    /// A segment extends past the end of the address space.
    SegmentOutOfBounds { end: usize, size: usize },
    /// The executable ended before a segment's bytes could be read.
    Truncated { offset: usize },
    /// Translating a segment address failed.
    Fault(Exception),
    /// The address space has no room below the stack safety margin.
    TooSmall { size: usize },
}

impl fmt::Display for AddrSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpaceError::Malformed(e) => write!(f, "malformed executable: {e}"),
            AddrSpaceError::OutOfFrames { needed, free } => {
                write!(f, "not enough physical frames: need {needed}, {free} free")
            }
            AddrSpaceError::SegmentOutOfBounds { end, size } => {
                write!(f, "segment ends at {end:#x}, past address space end {size:#x}")
            }
            AddrSpaceError::Truncated { offset } => {
                write!(f, "executable truncated at offset {offset:#x}")
            }
            AddrSpaceError::Fault(e) => write!(f, "loading segment: {e}"),
            AddrSpaceError::TooSmall { size } => {
                write!(f, "address space of {size} bytes leaves no room for a stack")
            }
        }
    }
}

impl core::error::Error for AddrSpaceError {}

impl From<NoffError> for AddrSpaceError {
    fn from(e: NoffError) -> Self {
        AddrSpaceError::Malformed(e)
    }
}

impl From<Exception> for AddrSpaceError {
    fn from(e: Exception) -> Self {
        AddrSpaceError::Fault(e)
    }
}

/// The memory image of one user process.
pub struct AddressSpace {
    num_pages: usize,
    page_table: SharedPageTable,
    registers: Option<RegisterPages>,
    pmm: Arc<PhysicalMemoryManager>,
    prev: Option<Box<AddressSpace>>,
    next: Option<Box<AddressSpace>>,
}

impl AddressSpace {
    /// Creates an address space running `executable`.
    ///
    /// Frames for the whole image are taken up front, zeroed, and the code and initialized
    /// data segments are copied in through the new page table, which is left installed on
    /// the machine. When the image does not fit in the free frames, nothing is allocated.
    ///
    /// # Panics
    ///
    /// Panics if the image needs more pages than the machine has frames in total, or if
    /// `pmm` tracks more frames than the machine's main memory holds.
    pub fn new<E: Executable + ?Sized>(
        executable: &E,
        machine: &mut Machine,
        pmm: Arc<PhysicalMemoryManager>,
    ) -> Result<Self, AddrSpaceError> {
        machine.check_allocator(&pmm);

        let plan = LoadPlan::new(executable, machine.config())?;
        let num_pages = plan.num_pages;
        if plan.size() <= STACK_SAFETY_MARGIN {
            return Err(AddrSpaceError::TooSmall { size: plan.size() });
        }

        assert!(
            num_pages <= pmm.total_frames(),
            "program needs {num_pages} pages but the machine only has {}",
            pmm.total_frames()
        );

        log::debug!(
            "initializing address space, num pages {num_pages}, size {}",
            plan.size()
        );

        let frames = pmm.reserve(num_pages).map_err(|e| match e {
            AllocError::InsufficientFrames { requested, free } => AddrSpaceError::OutOfFrames {
                needed: requested,
                free,
            },
            AllocError::OutOfMemory => AddrSpaceError::OutOfFrames {
                needed: num_pages,
                free: 0,
            },
        })?;

        // Uninitialized data and the stack rely on this.
        for &frame in &frames {
            machine.frame_mut(frame).fill(0);
        }

        let space = Self {
            num_pages,
            page_table: SharedPageTable::new(PageTable::from_frames(&frames)),
            registers: None,
            pmm,
            prev: None,
            next: None,
        };

        space.restore_state(machine);

        let loaded = space
            .load_segment(executable, machine, &plan.header.code, "code")
            .and_then(|()| {
                space.load_segment(executable, machine, &plan.header.init_data, "data")
            });
        if let Err(e) = loaded {
            machine.uninstall_page_table(&space.page_table);
            return Err(e);
        }

        space.log_page_table();
        Ok(space)
    }

    /// Copies one segment from the executable into this address space.
    ///
    /// Each page the segment touches is translated separately, so the frames backing the
    /// segment need not be contiguous.
    fn load_segment<E: Executable + ?Sized>(
        &self,
        executable: &E,
        machine: &mut Machine,
        segment: &Segment,
        name: &str,
    ) -> Result<(), AddrSpaceError> {
        if segment.is_empty() {
            return Ok(());
        }

        log::debug!(
            "initializing {name} segment, at {:#x}, size {}",
            segment.virtual_addr,
            segment.size
        );

        if segment.end() > self.size() {
            return Err(AddrSpaceError::SegmentOutOfBounds {
                end: segment.end(),
                size: self.size(),
            });
        }

        let mut addr = VirtualAddress::from(segment.virtual_addr);
        let mut offset = segment.in_file_addr as usize;
        let mut remaining = segment.size as usize;

        while remaining > 0 {
            let chunk = remaining.min(PAGE_SIZE - addr.page_offset());
            let phys = machine.translate(addr, 1, true)?.as_usize();

            let dest = &mut machine.memory_mut()[phys..phys + chunk];
            if executable.read_at(dest, offset) != chunk {
                return Err(AddrSpaceError::Truncated { offset });
            }

            addr = addr + chunk;
            offset += chunk;
            remaining -= chunk;
        }

        Ok(())
    }

    /// Sets the machine's registers for the start of the program.
    ///
    /// All registers are cleared, the program counter points at the entry point with the
    /// next program counter one instruction further, and the stack pointer sits just below
    /// the top of the address space.
    pub fn init_registers(&self, machine: &mut Machine) {
        for index in 0..NUM_TOTAL_REGS {
            machine.write_register(index, 0);
        }

        machine.write_register(PC_REG, ENTRY_POINT);
        machine.write_register(NEXT_PC_REG, ENTRY_POINT + 4);

        let stack = (self.size() - STACK_SAFETY_MARGIN) as u32;
        machine.write_register(STACK_REG, stack);
        log::debug!("initializing stack register to {stack:#x}");
    }

    /// Saves the machine's registers into this address space's register pages.
    ///
    /// The register pages are allocated the first time this is called and reused by every
    /// later call. They stay installed as the machine's page table until the next
    /// [`restore_state`](Self::restore_state).
    pub fn save_state(&mut self, machine: &mut Machine) -> Result<(), AllocError> {
        if self.registers.is_none() {
            self.registers = Some(RegisterPages::allocate(&self.pmm, machine)?);
        }
        if let Some(registers) = &self.registers {
            registers.save(machine);
        }
        Ok(())
    }

    /// Makes this address space the one the machine runs.
    ///
    /// Registers saved by an earlier [`save_state`](Self::save_state) are loaded back into
    /// the machine, then the main page table is installed.
    pub fn restore_state(&self, machine: &mut Machine) {
        if let Some(registers) = &self.registers {
            registers.restore(machine);
        }
        machine.install_page_table(self.page_table.clone());
    }

    /// Returns the number of pages in the main image.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Returns the size of the main image in bytes.
    pub fn size(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    pub fn page_table(&self) -> &SharedPageTable {
        &self.page_table
    }

    /// Returns the register page table, once registers have been saved.
    pub fn register_page_table(&self) -> Option<&SharedPageTable> {
        self.registers.as_ref().map(RegisterPages::table)
    }

    /// Returns the frames backing the main image, in virtual page order.
    pub fn frames(&self) -> Vec<FrameNumber> {
        self.page_table.lock().frames().collect()
    }

    /// Returns the frames holding saved registers, if any were ever saved.
    pub fn register_frames(&self) -> Vec<FrameNumber> {
        self.registers
            .as_ref()
            .map(RegisterPages::frames)
            .unwrap_or_default()
    }

    /// Returns every frame this address space owns.
    pub fn owned_frames(&self) -> Vec<FrameNumber> {
        let mut frames = self.frames();
        frames.extend(self.register_frames());
        frames
    }

    /// Links `prev` before this address space, returning any previously linked space.
    pub fn set_prev(&mut self, prev: Box<AddressSpace>) -> Option<Box<AddressSpace>> {
        self.prev.replace(prev)
    }

    /// Links `next` after this address space, returning any previously linked space.
    pub fn set_next(&mut self, next: Box<AddressSpace>) -> Option<Box<AddressSpace>> {
        self.next.replace(next)
    }

    pub fn prev(&self) -> Option<&AddressSpace> {
        self.prev.as_deref()
    }

    pub fn next(&self) -> Option<&AddressSpace> {
        self.next.as_deref()
    }

    /// Unlinks and returns the previous address space.
    pub fn take_prev(&mut self) -> Option<Box<AddressSpace>> {
        self.prev.take()
    }

    /// Unlinks and returns the next address space.
    pub fn take_next(&mut self) -> Option<Box<AddressSpace>> {
        self.next.take()
    }

    /// Returns a printable dump of the main page table.
    pub fn page_table_dump(&self) -> PageTableDump {
        let rows = self
            .page_table
            .lock()
            .iter()
            .map(|entry| (entry.virtual_page(), entry.physical_page()))
            .collect();
        PageTableDump { rows }
    }

    /// Logs the main page table at debug level.
    pub fn log_page_table(&self) {
        log::debug!("{}", self.page_table_dump());
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let mut table = self.page_table.lock();
        for entry in table.iter_mut().filter(|entry| entry.is_valid()) {
            self.pmm.deallocate(entry.physical_page());
            entry.invalidate();
        }
        drop(table);

        if let Some(registers) = self.registers.take() {
            registers.release(&self.pmm);
        }

        log::debug!(
            "released address space of {} pages, {} frames free",
            self.num_pages,
            self.pmm.free_frames()
        );
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("num_pages", &self.num_pages)
            .field("frames", &self.frames())
            .field("register_frames", &self.register_frames())
            .field("has_prev", &self.prev.is_some())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

/// A snapshot of a page table's virtual-to-physical mapping, for printing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTableDump {
    rows: Vec<(PageNumber, FrameNumber)>,
}

impl PageTableDump {
    pub fn rows(&self) -> &[(PageNumber, FrameNumber)] {
        &self.rows
    }
}

impl fmt::Display for PageTableDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const RULE: &str = "============================================";

        writeln!(f, "page table dump: {} pages in total", self.rows.len())?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "\tVirtPage, \tPhysPage")?;
        for (page, frame) in &self.rows {
            writeln!(f, "\t{page}, \t\t{frame}")?;
        }
        writeln!(f, "{RULE}")
    }
}
