//! The register file and its paging through virtual memory.
//!
//! When an address space is switched out, its registers are not copied into a host-side
//! structure. Instead the address space owns a few physical frames and a small page table
//! that maps them at virtual address zero; the registers are written through the machine's
//! ordinary memory path while that table is installed, and read back the same way when the
//! address space is switched in again.

use alloc::vec::Vec;

use crate::{
    AllocError, FrameNumber, Machine, PAGE_SIZE, PageTable, PhysicalMemoryManager,
    SharedPageTable, VirtualAddress,
};

/// Number of general-purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// Stack pointer.
pub const STACK_REG: usize = 29;
/// Holds the return address for procedure calls.
pub const RET_ADDR_REG: usize = 31;
/// Double register holding the result of a multiply (high half).
pub const HI_REG: usize = 32;
/// Double register holding the result of a multiply (low half).
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter, for the branch delay slot.
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging.
pub const PREV_PC_REG: usize = 36;
/// Target register of a delayed load.
pub const LOAD_REG: usize = 37;
/// Value to be loaded by a delayed load.
pub const LOAD_VALUE_REG: usize = 38;
/// The failing virtual address on an exception.
pub const BAD_VADDR_REG: usize = 39;

/// Total number of registers, including the special-purpose ones.
pub const NUM_TOTAL_REGS: usize = 40;

/// Width of one register in bytes.
pub const REGISTER_SIZE: usize = 4;

/// Size of the serialized register bank in bytes.
pub const REGISTER_BANK_SIZE: usize = NUM_TOTAL_REGS * REGISTER_SIZE;

/// Number of pages needed to hold the register bank.
pub const REGISTER_PAGES: usize = REGISTER_BANK_SIZE.div_ceil(PAGE_SIZE);

/// Returns the virtual address of a register within the register pages.
#[inline]
pub const fn register_address(index: usize) -> VirtualAddress {
    VirtualAddress::new(index * REGISTER_SIZE)
}

/// Frames holding a saved register bank, and the page table that maps them.
pub(crate) struct RegisterPages {
    table: SharedPageTable,
}

impl RegisterPages {
    /// Takes [`REGISTER_PAGES`] frames from the allocator and maps them.
    ///
    /// The frames are zeroed. On failure nothing is allocated.
    ///
    /// # Panics
    ///
    /// Panics if the allocator tracks more frames than the machine has.
    pub fn allocate(
        pmm: &PhysicalMemoryManager,
        machine: &mut Machine,
    ) -> Result<Self, AllocError> {
        machine.check_allocator(pmm);
        let frames = pmm.reserve(REGISTER_PAGES)?;
        for &frame in &frames {
            machine.frame_mut(frame).fill(0);
        }
        log::debug!("allocated register pages {frames:?}");

        Ok(Self {
            table: SharedPageTable::new(PageTable::from_frames(&frames)),
        })
    }

    /// Writes every register into the register pages.
    ///
    /// Leaves the register page table installed on the machine.
    pub fn save(&self, machine: &mut Machine) {
        machine.install_page_table(self.table.clone());
        for index in 0..NUM_TOTAL_REGS {
            let value = machine.read_register(index);
            machine
                .write_mem(register_address(index), REGISTER_SIZE, value)
                .expect("register pages should map the whole register bank");
        }
    }

    /// Loads every register back from the register pages.
    ///
    /// Leaves the register page table installed on the machine.
    pub fn restore(&self, machine: &mut Machine) {
        machine.install_page_table(self.table.clone());
        for index in 0..NUM_TOTAL_REGS {
            let value = machine
                .read_mem(register_address(index), REGISTER_SIZE)
                .expect("register pages should map the whole register bank");
            machine.write_register(index, value);
        }
    }

    pub fn table(&self) -> &SharedPageTable {
        &self.table
    }

    /// Returns the frames holding the register bank.
    pub fn frames(&self) -> Vec<FrameNumber> {
        self.table.lock().frames().collect()
    }

    /// Returns every frame to the allocator and invalidates the mappings.
    pub fn release(self, pmm: &PhysicalMemoryManager) {
        let mut table = self.table.lock();
        for entry in table.iter_mut().filter(|entry| entry.is_valid()) {
            pmm.deallocate(entry.physical_page());
            entry.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;

    #[test]
    fn bank_geometry() {
        assert_eq!(REGISTER_BANK_SIZE, 160);
        assert_eq!(REGISTER_PAGES, 2);
        assert_eq!(register_address(0), VirtualAddress::new(0));
        assert_eq!(register_address(32), VirtualAddress::new(PAGE_SIZE));
        assert_eq!(register_address(BAD_VADDR_REG), VirtualAddress::new(156));
    }

    #[test]
    fn save_then_restore_round_trips() {
        let mut machine = Machine::new(MachineConfig::default());
        let pmm = PhysicalMemoryManager::for_machine(machine.config());
        let pages = RegisterPages::allocate(&pmm, &mut machine).unwrap();

        for index in 0..NUM_TOTAL_REGS {
            machine.write_register(index, (index as u32).wrapping_mul(0x0101_0101));
        }
        machine.write_register(STACK_REG, u32::MAX);
        machine.write_register(PC_REG, 0);
        let saved = *machine.registers();

        pages.save(&mut machine);
        for index in 0..NUM_TOTAL_REGS {
            machine.write_register(index, 0xdead_beef);
        }
        pages.restore(&mut machine);

        assert_eq!(machine.registers(), &saved);
    }

    #[test]
    fn bank_lands_in_owned_frames() {
        let mut machine = Machine::new(MachineConfig::default());
        let pmm = PhysicalMemoryManager::for_machine(machine.config());
        pmm.allocate().unwrap();
        let pages = RegisterPages::allocate(&pmm, &mut machine).unwrap();

        machine.write_register(RET_ADDR_REG, 0x0403_0201);
        machine.write_register(HI_REG, 0x0807_0605);
        pages.save(&mut machine);

        let frames = pages.frames();
        assert_eq!(frames, [FrameNumber::new(1), FrameNumber::new(2)]);
        let first = machine.frame(frames[0]);
        assert_eq!(&first[RET_ADDR_REG * 4..RET_ADDR_REG * 4 + 4], &[1, 2, 3, 4]);
        let second = machine.frame(frames[1]);
        assert_eq!(&second[0..4], &[5, 6, 7, 8]);
        assert!(machine.installed_page_table().unwrap().ptr_eq(pages.table()));
    }

    #[test]
    fn release_returns_frames() {
        let mut machine = Machine::new(MachineConfig::default());
        let pmm = PhysicalMemoryManager::for_machine(machine.config());
        let pages = RegisterPages::allocate(&pmm, &mut machine).unwrap();
        let table = pages.table().clone();
        assert_eq!(pmm.free_frames(), 32 - REGISTER_PAGES);

        pages.release(&pmm);

        assert_eq!(pmm.free_frames(), 32);
        assert!(table.lock().iter().all(|entry| !entry.is_valid()));
    }

    #[test]
    #[should_panic(expected = "allocator tracks 32 frames but the machine has 8")]
    fn rejects_allocator_larger_than_memory() {
        let mut machine = Machine::new(MachineConfig {
            num_phys_pages: 8,
            ..MachineConfig::default()
        });
        let pmm = PhysicalMemoryManager::new(32);

        let _ = RegisterPages::allocate(&pmm, &mut machine);
    }

    #[test]
    fn allocation_fails_cleanly() {
        let mut machine = Machine::new(MachineConfig::default());
        let pmm = PhysicalMemoryManager::new(1);

        assert!(RegisterPages::allocate(&pmm, &mut machine).is_err());
        assert_eq!(pmm.free_frames(), 1);
    }
}
