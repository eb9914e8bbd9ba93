#![cfg_attr(not(test), no_std)]

//! # NOFF user program images
//!
//! NOFF is the flat executable format loaded by the address-space manager. A file starts
//! with a fixed header holding a magic number and three segment descriptors (code,
//! initialized data, uninitialized data), followed by the raw bytes of the code and
//! initialized data segments.
//!
//! Header words are stored little-endian. A header written on a machine of the other byte
//! order is still accepted: if the magic only matches after a 4-byte swap, every word of the
//! header is swapped before use.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// Magic number identifying a NOFF image.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// Number of 32-bit words in the on-disk header.
const HEADER_WORDS: usize = 10;

/// Size of the on-disk header in bytes.
pub const HEADER_SIZE: usize = HEADER_WORDS * 4;

/// Errors that can occur while decoding a NOFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoffError {
    /// Fewer than [`HEADER_SIZE`] bytes were available.
    Truncated { len: usize },
    /// The magic number did not match, in either byte order.
    BadMagic(u32),
}

impl fmt::Display for NoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoffError::Truncated { len } => {
                write!(f, "header truncated: {len} of {HEADER_SIZE} bytes")
            }
            NoffError::BadMagic(found) => {
                write!(f, "bad magic {found:#010x}, expected {NOFF_MAGIC:#010x}")
            }
        }
    }
}

impl core::error::Error for NoffError {}

/// One segment descriptor of a NOFF header.
///
/// Field order matches the on-disk layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Virtual address the segment is loaded at.
    pub virtual_addr: u32,
    /// Offset of the segment's bytes within the file.
    pub in_file_addr: u32,
    /// Size of the segment in bytes.
    pub size: u32,
}

impl Segment {
    pub const fn new(virtual_addr: u32, in_file_addr: u32, size: u32) -> Self {
        Self {
            virtual_addr,
            in_file_addr,
            size,
        }
    }

    /// An empty segment at address zero.
    pub const fn empty() -> Self {
        Self::new(0, 0, 0)
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the first virtual address past the end of this segment.
    pub const fn end(&self) -> usize {
        self.virtual_addr as usize + self.size as usize
    }

    const fn swap_bytes(self) -> Self {
        Self {
            virtual_addr: self.virtual_addr.swap_bytes(),
            in_file_addr: self.in_file_addr.swap_bytes(),
            size: self.size.swap_bytes(),
        }
    }
}

/// The fixed header at the start of every NOFF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffHeader {
    pub magic: u32,
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Creates a header with the correct magic for the given segments.
    pub const fn new(code: Segment, init_data: Segment, uninit_data: Segment) -> Self {
        Self {
            magic: NOFF_MAGIC,
            code,
            init_data,
            uninit_data,
        }
    }

    /// Decodes and validates a header from the start of `bytes`.
    ///
    /// The header is accepted as-is when its magic matches. When the magic only matches
    /// after swapping its bytes, the image was produced with the other byte order and the
    /// whole header is swapped.
    pub fn parse(bytes: &[u8]) -> Result<Self, NoffError> {
        if bytes.len() < HEADER_SIZE {
            return Err(NoffError::Truncated { len: bytes.len() });
        }

        let mut words = [0u32; HEADER_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let header = Self::from_words(words);
        if header.magic == NOFF_MAGIC {
            Ok(header)
        } else if header.magic.swap_bytes() == NOFF_MAGIC {
            Ok(header.swap_bytes())
        } else {
            Err(NoffError::BadMagic(header.magic))
        }
    }

    /// Builds a header from its raw words without validating it.
    pub const fn from_words(words: [u32; HEADER_WORDS]) -> Self {
        Self {
            magic: words[0],
            code: Segment::new(words[1], words[2], words[3]),
            init_data: Segment::new(words[4], words[5], words[6]),
            uninit_data: Segment::new(words[7], words[8], words[9]),
        }
    }

    /// Returns the header as raw words in on-disk order.
    pub const fn to_words(&self) -> [u32; HEADER_WORDS] {
        [
            self.magic,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ]
    }

    /// Swaps the byte order of every word in the header.
    ///
    /// Applying this twice yields the original header.
    pub const fn swap_bytes(self) -> Self {
        Self {
            magic: self.magic.swap_bytes(),
            code: self.code.swap_bytes(),
            init_data: self.init_data.swap_bytes(),
            uninit_data: self.uninit_data.swap_bytes(),
        }
    }

    /// Encodes the header in the canonical little-endian layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Returns the number of bytes a process running this image needs, including its stack.
    pub const fn image_size(&self, stack_size: usize) -> usize {
        self.code.size as usize
            + self.init_data.size as usize
            + self.uninit_data.size as usize
            + stack_size
    }

    /// Returns the number of pages a process running this image needs.
    pub const fn num_pages(&self, stack_size: usize, page_size: usize) -> usize {
        self.image_size(stack_size).div_ceil(page_size)
    }
}

/// Assembles a complete NOFF image in memory.
///
/// The code segment is placed directly after the header, followed by the initialized data.
pub struct NoffBuilder {
    code: Vec<u8>,
    code_addr: u32,
    data: Vec<u8>,
    data_addr: u32,
    bss_addr: u32,
    bss_size: u32,
    swapped: bool,
}

impl NoffBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            code_addr: 0,
            data: Vec::new(),
            data_addr: 0,
            bss_addr: 0,
            bss_size: 0,
            swapped: false,
        }
    }

    /// Sets the code segment.
    pub fn code(mut self, virtual_addr: u32, bytes: &[u8]) -> Self {
        self.code_addr = virtual_addr;
        self.code = bytes.to_vec();
        self
    }

    /// Sets the initialized data segment.
    pub fn data(mut self, virtual_addr: u32, bytes: &[u8]) -> Self {
        self.data_addr = virtual_addr;
        self.data = bytes.to_vec();
        self
    }

    /// Sets the uninitialized data segment. It occupies no space in the file.
    pub fn bss(mut self, virtual_addr: u32, size: u32) -> Self {
        self.bss_addr = virtual_addr;
        self.bss_size = size;
        self
    }

    /// Writes the header in the opposite byte order.
    pub fn swapped(mut self, swapped: bool) -> Self {
        self.swapped = swapped;
        self
    }

    /// Returns the header the image will carry, in host byte order.
    pub fn header(&self) -> NoffHeader {
        let code_offset = HEADER_SIZE;
        let data_offset = code_offset + self.code.len();

        NoffHeader::new(
            Segment::new(self.code_addr, code_offset as u32, self.code.len() as u32),
            Segment::new(self.data_addr, data_offset as u32, self.data.len() as u32),
            Segment::new(self.bss_addr, 0, self.bss_size),
        )
    }

    /// Builds the final image.
    pub fn build(self) -> Vec<u8> {
        let header = if self.swapped {
            self.header().swap_bytes()
        } else {
            self.header()
        };

        let mut output = Vec::with_capacity(HEADER_SIZE + self.code.len() + self.data.len());
        output.extend_from_slice(&header.to_bytes());
        output.extend_from_slice(&self.code);
        output.extend_from_slice(&self.data);
        output
    }
}

impl Default for NoffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> NoffHeader {
        NoffHeader::new(
            Segment::new(0, 40, 0x1234),
            Segment::new(0x1240, 0x1274, 0x56),
            Segment::new(0x12a0, 0, 0x300),
        )
    }

    #[test]
    fn parses_native_header() {
        let header = sample_header();
        let parsed = NoffHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn parses_swapped_header() {
        let header = sample_header();
        let bytes = header.swap_bytes().to_bytes();

        let parsed = NoffHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.magic, NOFF_MAGIC);
        assert_eq!(parsed.code, header.code);
        assert_eq!(parsed.init_data, header.init_data);
        assert_eq!(parsed.uninit_data, header.uninit_data);
    }

    #[test]
    fn swap_is_an_involution() {
        let header = sample_header();
        assert_ne!(header.swap_bytes(), header);
        assert_eq!(header.swap_bytes().swap_bytes(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());

        assert_eq!(
            NoffHeader::parse(&bytes),
            Err(NoffError::BadMagic(0xdead_beef))
        );
    }

    #[test]
    fn rejects_short_input() {
        let bytes = sample_header().to_bytes();
        assert_eq!(
            NoffHeader::parse(&bytes[..12]),
            Err(NoffError::Truncated { len: 12 })
        );
    }

    #[test]
    fn computes_page_count() {
        let header = NoffHeader::new(Segment::new(0, 40, 10), Segment::empty(), Segment::empty());
        assert_eq!(header.image_size(1024), 1034);
        assert_eq!(header.num_pages(1024, 128), 9);

        let exact = NoffHeader::new(Segment::new(0, 40, 128), Segment::empty(), Segment::empty());
        assert_eq!(exact.num_pages(1024, 128), 9);
    }

    #[test]
    fn builder_lays_out_segments() {
        let image = NoffBuilder::new()
            .code(0, &[1, 2, 3, 4])
            .data(0x80, &[9, 9])
            .bss(0x100, 64)
            .build();

        assert_eq!(image.len(), HEADER_SIZE + 6);

        let header = NoffHeader::parse(&image).unwrap();
        assert_eq!(header.code, Segment::new(0, HEADER_SIZE as u32, 4));
        assert_eq!(header.init_data, Segment::new(0x80, HEADER_SIZE as u32 + 4, 2));
        assert_eq!(header.uninit_data, Segment::new(0x100, 0, 64));
        assert_eq!(&image[HEADER_SIZE..HEADER_SIZE + 4], &[1, 2, 3, 4]);
        assert_eq!(&image[HEADER_SIZE + 4..], &[9, 9]);
    }

    #[test]
    fn builder_writes_swapped_header() {
        let image = NoffBuilder::new().code(0, &[0; 8]).swapped(true).build();

        assert_eq!(&image[0..4], &NOFF_MAGIC.to_be_bytes());
        let header = NoffHeader::parse(&image).unwrap();
        assert_eq!(header.code.size, 8);
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            format!("{}", NoffError::BadMagic(0x1)),
            "bad magic 0x00000001, expected 0x00badfad"
        );
        assert_eq!(
            format!("{}", NoffError::Truncated { len: 3 }),
            "header truncated: 3 of 40 bytes"
        );
    }
}
