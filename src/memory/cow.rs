//! Copy-on-write share counts.
//!
//! One counter per physical frame, indexed by frame number. A zero counter
//! means the frame is not registered: any copy-on-write mapping of it is the
//! only one left. Registered counters are always at least two.

use x86_64::structures::paging::PhysFrame;

use crate::constants::memory::PAGE_SIZE;

pub struct CowRegistry {
    counts: &'static mut [u16],
    registered: usize,
}

impl CowRegistry {
    /// A registry for frames `0..storage.len()`. The storage must be zeroed.
    pub fn new(storage: &'static mut [u16]) -> Self {
        debug_assert!(storage.iter().all(|&count| count == 0));
        CowRegistry {
            counts: storage,
            registered: 0,
        }
    }

    fn index(&self, frame: PhysFrame) -> usize {
        let index = (frame.start_address().as_u64() / PAGE_SIZE) as usize;
        assert!(
            index < self.counts.len(),
            "frame {:#x} is beyond the copy-on-write registry",
            frame.start_address().as_u64()
        );
        index
    }

    /// Address spaces currently mapping `frame` copy-on-write.
    pub fn owners(&self, frame: PhysFrame) -> usize {
        match self.counts[self.index(frame)] {
            0 => 1,
            count => count as usize,
        }
    }

    /// Records one more address space mapping `frame`.
    pub fn share(&mut self, frame: PhysFrame) {
        let index = self.index(frame);
        match self.counts[index] {
            0 => {
                self.counts[index] = 2;
                self.registered += 1;
            }
            u16::MAX => panic!(
                "copy-on-write count overflow for frame {:#x}",
                frame.start_address().as_u64()
            ),
            count => self.counts[index] = count + 1,
        }
    }

    /// Drops one owner of `frame`. Returns true if the caller was the last
    /// one and now owns the frame outright.
    pub fn release(&mut self, frame: PhysFrame) -> bool {
        let index = self.index(frame);
        match self.counts[index] {
            0 => true,
            1 => panic!(
                "copy-on-write count underflow for frame {:#x}",
                frame.start_address().as_u64()
            ),
            2 => {
                self.counts[index] = 0;
                self.registered -= 1;
                false
            }
            count => {
                self.counts[index] = count - 1;
                false
            }
        }
    }

    /// Frames with more than one owner.
    pub fn shared_frames(&self) -> usize {
        self.registered
    }
}
