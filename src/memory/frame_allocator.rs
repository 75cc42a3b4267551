//! Physical frame allocation across the low (DMA) pool and the default pool.

use core::ops::{BitOr, Range};

use log::info;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame},
    PhysAddr,
};

use crate::{
    constants::memory::LOW_POOL_LIMIT,
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        memory_map::{usable_frames, MemoryRegion},
        stack_frame_allocator::{DefaultPoolStorage, StackFrameAllocator},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pool {
    /// Below `LOW_POOL_LIMIT`, kept for devices that can only reach low memory.
    Low,
    Default,
}

impl Pool {
    /// The pool a frame belongs to, fixed by its address.
    pub fn containing(frame: PhysFrame) -> Pool {
        if frame.start_address().as_u64() < LOW_POOL_LIMIT {
            Pool::Low
        } else {
            Pool::Default
        }
    }
}

/// A set of pools, for counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolMask(u8);

impl PoolMask {
    pub const LOW: PoolMask = PoolMask(1);
    pub const DEFAULT: PoolMask = PoolMask(2);
    pub const ALL: PoolMask = PoolMask(3);

    pub fn contains(self, pool: Pool) -> bool {
        self.0 & PoolMask::from(pool).0 != 0
    }
}

impl From<Pool> for PoolMask {
    fn from(pool: Pool) -> Self {
        match pool {
            Pool::Low => PoolMask::LOW,
            Pool::Default => PoolMask::DEFAULT,
        }
    }
}

impl BitOr for PoolMask {
    type Output = PoolMask;

    fn bitor(self, rhs: PoolMask) -> PoolMask {
        PoolMask(self.0 | rhs.0)
    }
}

/// Owner of every free physical frame.
///
/// Running out of frames is fatal: every caller is a part of the kernel that
/// cannot continue without memory. Callers that can fail gracefully check
/// [`free_count`](Self::free_count) up front.
pub struct GlobalFrameAllocator {
    low: BitmapFrameAllocator,
    default: StackFrameAllocator,
}

impl GlobalFrameAllocator {
    /// Splits the usable memory of `memory_map` into the two pools.
    ///
    /// `kernel_image` is excluded, as is frame 0. `default_storage` must have
    /// room for every default-pool frame.
    pub fn init(
        memory_map: &[MemoryRegion],
        kernel_image: Range<PhysAddr>,
        default_storage: DefaultPoolStorage,
    ) -> Self {
        let mut allocator = GlobalFrameAllocator {
            low: BitmapFrameAllocator::new(),
            default: StackFrameAllocator::new(default_storage),
        };

        for frame in usable_frames(memory_map, kernel_image) {
            match Pool::containing(frame) {
                Pool::Low => allocator.low.add_frame(frame),
                Pool::Default => allocator.default.add_frame(frame),
            }
        }

        info!(
            "Frame pools ready: {} low frames, {} default frames",
            allocator.low.total_frames(),
            allocator.default.total_frames()
        );
        allocator
    }

    /// Takes one free frame from `pool`.
    ///
    /// # Panics
    /// If the pool is exhausted.
    pub fn allocate(&mut self, pool: Pool) -> PhysFrame {
        let frame = match pool {
            Pool::Low => self.low.allocate_frame(),
            Pool::Default => self.default.allocate_frame(),
        };
        frame.unwrap_or_else(|| panic!("{:?} frame pool exhausted", pool))
    }

    /// Fills `frames` from `pool`, all or nothing.
    ///
    /// # Panics
    /// If the pool holds fewer than `frames.len()` frames; nothing is taken then.
    pub fn allocate_many(&mut self, pool: Pool, frames: &mut [PhysFrame]) {
        let available = self.free_count(pool.into());
        assert!(
            available >= frames.len(),
            "{:?} frame pool exhausted: {} requested, {} free",
            pool,
            frames.len(),
            available
        );
        for frame in frames.iter_mut() {
            *frame = self.allocate(pool);
        }
    }

    /// Returns `frame` to `pool`.
    ///
    /// # Panics
    /// If `frame` belongs to the other pool or is already free.
    pub fn free(&mut self, frame: PhysFrame, pool: Pool) {
        assert_eq!(
            Pool::containing(frame),
            pool,
            "frame {:#x} freed to the wrong pool",
            frame.start_address().as_u64()
        );
        // SAFETY: the pools assert the frame is theirs and currently allocated
        unsafe {
            match pool {
                Pool::Low => self.low.deallocate_frame(frame),
                Pool::Default => self.default.deallocate_frame(frame),
            }
        }
    }

    pub fn free_many(&mut self, frames: &[PhysFrame], pool: Pool) {
        for &frame in frames {
            self.free(frame, pool);
        }
    }

    pub fn free_count(&self, pools: PoolMask) -> usize {
        let mut count = 0;
        if pools.contains(Pool::Low) {
            count += self.low.free_frames();
        }
        if pools.contains(Pool::Default) {
            count += self.default.free_frames();
        }
        count
    }

    pub fn total_count(&self, pools: PoolMask) -> usize {
        let mut count = 0;
        if pools.contains(Pool::Low) {
            count += self.low.total_frames();
        }
        if pools.contains(Pool::Default) {
            count += self.default.total_frames();
        }
        count
    }
}
