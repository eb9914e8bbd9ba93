//! Executable files and the NOFF loader.
//!
//! The loader reads and validates an image's header and works out how many pages a process
//! running it needs. It never touches physical memory; the address space does the copying.

use alloc::vec::Vec;

use noff::{HEADER_SIZE, NoffError, NoffHeader};

use crate::{MachineConfig, PAGE_SIZE};

/// A source of executable image bytes.
pub trait Executable {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the number read.
    ///
    /// A short count means the end of the file was reached.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
}

impl Executable for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let Some(available) = self.get(offset..) else {
            return 0;
        };
        let count = buf.len().min(available.len());
        buf[..count].copy_from_slice(&available[..count]);
        count
    }
}

impl Executable for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.as_slice().read_at(buf, offset)
    }
}

#[cfg(any(test, feature = "std"))]
impl Executable for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = self;
        if file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return 0;
        }

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(count) => total += count,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("read of executable failed at offset {offset}: {e}");
                    break;
                }
            }
        }
        total
    }
}

/// The loader's verdict on an executable: its header and the size of its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    /// The validated header, in host byte order.
    pub header: NoffHeader,
    /// Pages needed for code, data, uninitialized data and stack.
    pub num_pages: usize,
}

impl LoadPlan {
    /// Reads and validates the header of `executable`.
    pub fn new<E: Executable + ?Sized>(
        executable: &E,
        config: &MachineConfig,
    ) -> Result<Self, NoffError> {
        let mut bytes = [0u8; HEADER_SIZE];
        let read = executable.read_at(&mut bytes, 0);
        let header = NoffHeader::parse(&bytes[..read])?;

        Ok(Self::from_header(header, config))
    }

    /// Sizes the address space for an already validated header.
    pub fn from_header(header: NoffHeader, config: &MachineConfig) -> Self {
        Self {
            header,
            num_pages: header.num_pages(config.user_stack_size, PAGE_SIZE),
        }
    }

    /// Returns the size of the address space in bytes.
    pub const fn size(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noff::{NoffBuilder, Segment};

    #[test]
    fn slice_reads_are_bounded() {
        let data = [1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];

        assert_eq!(data[..].read_at(&mut buf, 0), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(data[..].read_at(&mut buf, 3), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(data[..].read_at(&mut buf, 5), 0);
        assert_eq!(data[..].read_at(&mut buf, 50), 0);
    }

    #[test]
    fn file_reads_at_offset() {
        use std::io::Write;

        let path = std::env::temp_dir().join(format!("vmm-exe-{}.noff", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[10, 11, 12, 13, 14])
            .unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(&mut buf, 1), 3);
        assert_eq!(buf, [11, 12, 13]);
        assert_eq!(file.read_at(&mut buf, 4), 1);
        assert_eq!(buf[0], 14);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn plans_page_count() {
        let image = NoffBuilder::new()
            .code(0, &[0; 10])
            .data(0x100, &[0; 20])
            .bss(0x200, 30)
            .build();
        let config = MachineConfig::default();

        let plan = LoadPlan::new(&image, &config).unwrap();
        assert_eq!(plan.header.code.size, 10);
        assert_eq!(plan.num_pages, (10 + 20 + 30 + 1024usize).div_ceil(128));
        assert_eq!(plan.size(), plan.num_pages * PAGE_SIZE);
    }

    #[test]
    fn honours_configured_stack() {
        let header = NoffHeader::new(Segment::new(0, 40, 100), Segment::empty(), Segment::empty());
        let config = MachineConfig {
            user_stack_size: 284,
            ..MachineConfig::default()
        };

        assert_eq!(LoadPlan::from_header(header, &config).num_pages, 3);
    }

    #[test]
    fn rejects_malformed_images() {
        let config = MachineConfig::default();

        let garbage = alloc::vec![0xffu8; 64];
        assert_eq!(
            LoadPlan::new(&garbage, &config),
            Err(NoffError::BadMagic(0xffff_ffff))
        );

        let short = alloc::vec![0u8; 8];
        assert_eq!(
            LoadPlan::new(&short, &config),
            Err(NoffError::Truncated { len: 8 })
        );
    }
}
