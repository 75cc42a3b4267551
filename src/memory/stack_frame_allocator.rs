//! Default pool: a stack of free frame numbers.
//!
//! Allocation and free are a pop and a push. Two bitmaps indexed by frame
//! number record which frames the pool manages and which of those are handed
//! out, so frees of foreign or already-free frames are caught. All storage
//! is handed in by the boot code, since nothing can be allocated before this
//! pool exists.

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, PAGE_SIZE},
    memory::bitmap_frame_allocator::{clear_bit, is_bit_set, set_bit},
};

/// Storage for a default pool.
pub struct DefaultPoolStorage {
    /// One slot per frame the pool may be given.
    pub stack: &'static mut [u32],
    /// [`state_words`] words for the highest frame number in the memory map.
    pub state: &'static mut [u64],
}

/// Bitmap words a pool needs to track frame numbers `0..frames`.
pub const fn state_words(frames: usize) -> usize {
    2 * frames.div_ceil(BITMAP_ENTRY_SIZE)
}

pub struct StackFrameAllocator {
    slots: &'static mut [u32],
    top: usize,
    total_frames: usize,
    managed: &'static mut [u64],
    in_use: &'static mut [u64],
}

impl StackFrameAllocator {
    /// An empty pool able to hold `storage.stack.len()` frames.
    pub fn new(storage: DefaultPoolStorage) -> Self {
        let DefaultPoolStorage { stack, state } = storage;
        let half = state.len() / 2;
        let (managed, in_use) = state.split_at_mut(half);
        managed.fill(0);
        in_use.fill(0);
        StackFrameAllocator {
            slots: stack,
            top: 0,
            total_frames: 0,
            managed,
            in_use,
        }
    }

    /// Hands a free frame to the pool during init.
    pub fn add_frame(&mut self, frame: PhysFrame) {
        let number = frame_number(frame) as usize;
        assert!(
            number < self.managed.len() * BITMAP_ENTRY_SIZE,
            "frame {:#x} is beyond the default pool bitmap",
            frame.start_address().as_u64()
        );
        assert!(
            !is_bit_set(self.managed, number),
            "default frame {:#x} added twice",
            frame.start_address().as_u64()
        );
        set_bit(self.managed, number);
        self.push(frame);
        self.total_frames += 1;
    }

    fn push(&mut self, frame: PhysFrame) {
        assert!(
            self.top < self.slots.len(),
            "frame stack overflow at {:#x}",
            frame.start_address().as_u64()
        );
        self.slots[self.top] = frame_number(frame);
        self.top += 1;
    }

    fn manages(&self, number: usize) -> bool {
        number < self.managed.len() * BITMAP_ENTRY_SIZE && is_bit_set(self.managed, number)
    }

    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let number = frame_number(frame) as usize;
        self.manages(number) && is_bit_set(self.in_use, number)
    }

    pub fn free_frames(&self) -> usize {
        self.top
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

fn frame_number(frame: PhysFrame) -> u32 {
    (frame.start_address().as_u64() / PAGE_SIZE) as u32
}

unsafe impl FrameAllocator<Size4KiB> for StackFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        let number = self.slots[self.top];
        set_bit(self.in_use, number as usize);
        let addr = number as u64 * PAGE_SIZE;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

impl FrameDeallocator<Size4KiB> for StackFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let number = frame_number(frame) as usize;
        assert!(
            self.manages(number),
            "frame {:#x} does not belong to the default pool",
            frame.start_address().as_u64()
        );
        assert!(
            is_bit_set(self.in_use, number),
            "double free of default frame {:#x}",
            frame.start_address().as_u64()
        );
        clear_bit(self.in_use, number);
        self.push(frame);
    }
}
