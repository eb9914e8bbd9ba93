#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! The Virtual Memory Manager builds and runs the memory images of user processes on a
//! simulated single-CPU machine. It provides:
//!
//! - A frame bitmap allocator shared by every address space.
//! - Flat page tables and a machine that translates through whichever one is installed.
//! - Loading of NOFF executables into freshly allocated, zeroed frames.
//! - Context-switch support that pages the register file through virtual memory.
//!
//! Address spaces are fixed-size and fully resident: there is no demand paging, no page
//! replacement and no sharing of frames between address spaces.

extern crate alloc;

mod address;
mod address_space;
mod executable;
mod machine;
mod numbers;
mod page_table;
mod physical_memory_manager;
pub mod registers;
mod translation;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddrSpaceError, AddressSpace, PageTableDump};
pub use executable::{Executable, LoadPlan};
pub use machine::{
    Exception, Machine, MachineConfig, NUM_PHYS_PAGES, PAGE_SIZE, USER_STACK_SIZE,
};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{PageTable, SharedPageTable};
pub use physical_memory_manager::{AllocError, PhysicalMemoryManager};
pub use translation::{EntryFlags, TranslationEntry};
