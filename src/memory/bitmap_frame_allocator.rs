//! Low-memory pool: a presence bitmap over the frames below `LOW_POOL_LIMIT`.
//!
//! A set bit means the frame is in use. Frames the pool was never given stay
//! set forever, and a second bitmap remembers which frames it manages so a
//! foreign frame can't be freed into it.

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, LOW_POOL_FRAMES};

const BITMAP_WORDS: usize = LOW_POOL_FRAMES / BITMAP_ENTRY_SIZE;

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    to_allocate: usize,
    bitmap: [u64; BITMAP_WORDS],
    managed: [u64; BITMAP_WORDS],
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapFrameAllocator {
    /// An empty pool: every frame in use, none managed.
    pub const fn new() -> Self {
        BitmapFrameAllocator {
            total_frames: 0,
            free_frames: 0,
            to_allocate: 0,
            bitmap: [FULL_BITMAP_ENTRY; BITMAP_WORDS],
            managed: [0; BITMAP_WORDS],
        }
    }

    /// Hands a free frame to the pool during init.
    pub fn add_frame(&mut self, frame: PhysFrame) {
        let index = frame_index(frame);
        assert!(
            !is_bit_set(&self.managed, index),
            "low frame {:#x} added twice",
            frame.start_address().as_u64()
        );
        set_bit(&mut self.managed, index);
        clear_bit(&mut self.bitmap, index);
        self.total_frames += 1;
        self.free_frames += 1;
    }

    /// Check if frame is used
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        is_bit_set(&self.bitmap, frame_index(frame))
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

fn frame_index(frame: PhysFrame) -> usize {
    let index = frame.start_address().as_u64() as usize / FRAME_SIZE;
    assert!(index < LOW_POOL_FRAMES, "frame {:#x} is not a low frame", index * FRAME_SIZE);
    index
}

pub(crate) fn set_bit(bitmap: &mut [u64], index: usize) {
    bitmap[index / BITMAP_ENTRY_SIZE] |= 1 << (index % BITMAP_ENTRY_SIZE);
}

pub(crate) fn clear_bit(bitmap: &mut [u64], index: usize) {
    bitmap[index / BITMAP_ENTRY_SIZE] &= !(1 << (index % BITMAP_ENTRY_SIZE));
}

pub(crate) fn is_bit_set(bitmap: &[u64], index: usize) -> bool {
    bitmap[index / BITMAP_ENTRY_SIZE] & (1 << (index % BITMAP_ENTRY_SIZE)) != 0
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    /// Takes the lowest free frame at or after the word cursor.
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }
        loop {
            let word = self.bitmap[self.to_allocate];
            if word != FULL_BITMAP_ENTRY {
                let index = self.to_allocate * BITMAP_ENTRY_SIZE + word.trailing_ones() as usize;
                set_bit(&mut self.bitmap, index);
                self.free_frames -= 1;
                let addr = (index * FRAME_SIZE) as u64;
                return Some(PhysFrame::containing_address(PhysAddr::new(addr)));
            }
            self.to_allocate = (self.to_allocate + 1) % BITMAP_WORDS;
        }
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let index = frame_index(frame);
        assert!(
            is_bit_set(&self.managed, index),
            "frame {:#x} does not belong to the low pool",
            frame.start_address().as_u64()
        );
        assert!(
            is_bit_set(&self.bitmap, index),
            "double free of low frame {:#x}",
            frame.start_address().as_u64()
        );
        clear_bit(&mut self.bitmap, index);
        self.free_frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(number * FRAME_SIZE as u64))
    }

    fn pool_with(numbers: impl Iterator<Item = u64>) -> BitmapFrameAllocator {
        let mut pool = BitmapFrameAllocator::new();
        for number in numbers {
            pool.add_frame(frame(number));
        }
        pool
    }

    #[test]
    fn test_allocates_only_managed_frames() {
        let mut pool = pool_with([3, 70, 71].into_iter());
        let mut got = [0u64; 3];
        for slot in got.iter_mut() {
            *slot = pool.allocate_frame().unwrap().start_address().as_u64() / FRAME_SIZE as u64;
        }
        got.sort_unstable();
        assert_eq!(got, [3, 70, 71]);
        assert_eq!(pool.allocate_frame(), None);
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    fn test_free_returns_frame() {
        let mut pool = pool_with(256..260);
        let a = pool.allocate_frame().unwrap();
        let b = pool.allocate_frame().unwrap();
        assert_ne!(a, b);
        assert!(pool.is_frame_used(a));
        unsafe { pool.deallocate_frame(a) };
        assert!(!pool.is_frame_used(a));
        assert_eq!(pool.free_frames(), 3);
        assert_eq!(pool.total_frames(), 4);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut pool = pool_with(256..258);
        let a = pool.allocate_frame().unwrap();
        unsafe {
            pool.deallocate_frame(a);
            pool.deallocate_frame(a);
        }
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_unmanaged_free_panics() {
        let mut pool = pool_with(256..258);
        unsafe { pool.deallocate_frame(frame(1000)) };
    }
}
