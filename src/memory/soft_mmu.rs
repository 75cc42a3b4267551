//! A simulated MMU over a block of host memory standing in for physical RAM.
//!
//! Frames are offsets into the block, so the whole subsystem (windows,
//! clones, faults, the heap) runs unchanged on a development machine.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use x86_64::{structures::paging::PhysFrame, PhysAddr, VirtAddr};

use crate::{constants::memory::PAGE_SIZE, memory::mmu::Mmu};

pub struct SoftMmu {
    ram: *mut u8,
    len: usize,
    root: AtomicU64,
    global_pages: AtomicBool,
    flushes: AtomicUsize,
    full_flushes: AtomicUsize,
}

// The RAM block is owned exclusively by this MMU for the rest of the program.
unsafe impl Send for SoftMmu {}
unsafe impl Sync for SoftMmu {}

impl SoftMmu {
    /// Simulated physical memory covering addresses `0..ram.len()`.
    pub fn new(ram: &'static mut [u8]) -> Self {
        assert_eq!(ram.len() as u64 % PAGE_SIZE, 0, "RAM must be whole frames");
        SoftMmu {
            ram: ram.as_mut_ptr(),
            len: ram.len(),
            root: AtomicU64::new(0),
            global_pages: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            full_flushes: AtomicUsize::new(0),
        }
    }

    pub fn set_global_pages(&self, enabled: bool) {
        self.global_pages.store(enabled, Ordering::Relaxed);
    }

    /// Host pointer to the first byte of `frame`.
    pub fn frame_ptr(&self, frame: PhysFrame) -> *mut u8 {
        let offset = frame.start_address().as_u64() as usize;
        assert!(
            offset + PAGE_SIZE as usize <= self.len,
            "frame {:#x} is outside simulated RAM",
            offset
        );
        // SAFETY: bounds checked above
        unsafe { self.ram.add(offset) }
    }

    /// Single-page invalidations issued so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Whole-cache invalidations issued so far, root switches included.
    pub fn full_flush_count(&self) -> usize {
        self.full_flushes.load(Ordering::Relaxed)
    }
}

impl Mmu for SoftMmu {
    fn active_root(&self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(self.root.load(Ordering::Acquire)))
    }

    fn load_root(&self, root: PhysFrame) {
        self.root
            .store(root.start_address().as_u64(), Ordering::Release);
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush(&self, _addr: VirtAddr) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn global_pages(&self) -> bool {
        self.global_pages.load(Ordering::Relaxed)
    }

    fn virt_ptr(&self, addr: VirtAddr, frame: PhysFrame) -> *mut u8 {
        let offset = u64::from(addr.page_offset()) as usize;
        // SAFETY: the offset stays within the frame
        unsafe { self.frame_ptr(frame).add(offset) }
    }
}
