//! Physical memory manager using a frame bitmap.
//!
//! Every physical frame of the simulated machine is tracked by one bit: set when the
//! frame belongs to some address space, clear when it is free. The bitmap is shared by
//! every address space, so it lives behind a lock and is reached through an `Arc`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::{FrameNumber, MachineConfig};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Errors that can occur during physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is left.
    OutOfMemory,
    /// A batch request asked for more frames than are currently free.
    InsufficientFrames { requested: usize, free: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical frames"),
            AllocError::InsufficientFrames { requested, free } => {
                write!(f, "requested {requested} frames but only {free} are free")
            }
        }
    }
}

impl core::error::Error for AllocError {}

/// One bit per frame; a set bit marks an allocated frame.
struct FrameBitmap {
    words: Box<[u64]>,
    num_frames: usize,
    free: usize,
}

impl FrameBitmap {
    fn new(num_frames: usize) -> Self {
        let words = alloc::vec![0u64; num_frames.div_ceil(BITS_PER_WORD)].into_boxed_slice();
        Self {
            words,
            num_frames,
            free: num_frames,
        }
    }

    fn test(&self, index: usize) -> bool {
        assert!(index < self.num_frames, "frame {index} out of range");
        self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn mark(&mut self, index: usize) {
        debug_assert!(!self.test(index));
        self.words[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
        self.free -= 1;
    }

    fn clear(&mut self, index: usize) {
        debug_assert!(self.test(index));
        self.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
        self.free += 1;
    }

    /// Finds the lowest clear bit and sets it.
    fn find(&mut self) -> Option<usize> {
        let (word_index, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let index = word_index * BITS_PER_WORD + word.trailing_ones() as usize;
        if index >= self.num_frames {
            return None;
        }
        self.mark(index);
        Some(index)
    }
}

/// Physical memory manager for the simulated machine.
///
/// Frames are handed out lowest-numbered first. The manager performs no zeroing; callers
/// that need clean frames clear them through the machine.
pub struct PhysicalMemoryManager {
    bitmap: Mutex<FrameBitmap>,
}

impl PhysicalMemoryManager {
    /// Creates a manager for `total_frames` frames, all of them free.
    pub fn new(total_frames: usize) -> Self {
        Self {
            bitmap: Mutex::new(FrameBitmap::new(total_frames)),
        }
    }

    /// Creates a manager covering every frame of a machine's main memory.
    pub fn for_machine(config: &MachineConfig) -> Self {
        Self::new(config.num_phys_pages)
    }

    /// Allocates a single frame.
    pub fn allocate(&self) -> Result<FrameNumber, AllocError> {
        let frame = self
            .bitmap
            .lock()
            .find()
            .map(FrameNumber::new)
            .ok_or(AllocError::OutOfMemory)?;
        log::trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Allocates `count` frames, or none at all.
    ///
    /// The free-frame check and the allocation happen under one lock, so a request either
    /// gets every frame it asked for or leaves the bitmap untouched.
    pub fn reserve(&self, count: usize) -> Result<Vec<FrameNumber>, AllocError> {
        let mut bitmap = self.bitmap.lock();
        if count > bitmap.free {
            return Err(AllocError::InsufficientFrames {
                requested: count,
                free: bitmap.free,
            });
        }

        let frames: Vec<FrameNumber> = (0..count)
            .map_while(|_| bitmap.find().map(FrameNumber::new))
            .collect();
        assert_eq!(frames.len(), count, "frame bitmap free count out of sync");

        log::trace!("reserved {count} frames, {} left", bitmap.free);
        Ok(frames)
    }

    /// Returns a frame to the free pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame is out of range or not currently allocated. Either indicates
    /// that two owners believed they held the same frame.
    pub fn deallocate(&self, frame: FrameNumber) {
        let mut bitmap = self.bitmap.lock();
        assert!(
            bitmap.test(frame.as_usize()),
            "double free of physical frame {frame}"
        );
        bitmap.clear(frame.as_usize());
        log::trace!("freed frame {frame}");
    }

    /// Returns true if the frame is currently allocated.
    ///
    /// # Panics
    ///
    /// Panics if the frame is out of range.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.bitmap.lock().test(frame.as_usize())
    }

    /// Returns the total number of frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.bitmap.lock().num_frames
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.bitmap.lock().free
    }

    /// Returns the number of allocated frames.
    pub fn allocated_frames(&self) -> usize {
        let bitmap = self.bitmap.lock();
        bitmap.num_frames - bitmap.free
    }
}
