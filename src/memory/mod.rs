pub mod bitmap_frame_allocator;
pub mod cow;
pub mod entry;
pub mod error;
pub mod frame_allocator;
pub mod heap;
pub mod memory_map;
pub mod mmu;
pub mod paging;
pub mod soft_mmu;
pub mod stack_frame_allocator;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(target_arch = "x86")]
pub mod tlb;
pub mod window;

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::null_mut,
};

use error::MemoryError;
use heap::KernelHeap;
use log::info;
use mmu::Mmu;
use paging::PageTableManager;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::constants::memory::HEAP_GRANULE;

/// Page tables plus the kernel heap living in them.
pub struct Memory<M: Mmu> {
    pub paging: PageTableManager<M>,
    pub heap: KernelHeap,
}

impl<M: Mmu> Memory<M> {
    /// Reserves the shared kernel page tables, then sets up the heap over
    /// `[heap_start, heap_start + heap_size)`.
    pub fn init(
        mut paging: PageTableManager<M>,
        heap_start: VirtAddr,
        heap_size: u64,
    ) -> Result<Self, MemoryError> {
        paging.reserve_kernel_space();
        let heap = KernelHeap::init(&mut paging, heap_start, heap_size)?;
        info!(
            "Kernel heap at {:#x}, {} KiB",
            heap_start.as_u64(),
            heap_size / 1024
        );
        Ok(Memory { paging, heap })
    }

    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        self.heap.allocate(&mut self.paging, size)
    }

    /// [`allocate`](Self::allocate) for a `Layout`; the heap only guarantees
    /// [`HEAP_GRANULE`] alignment.
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<VirtAddr, MemoryError> {
        check_layout(layout)?;
        self.allocate(layout.size())
    }

    pub fn calloc(&mut self, count: usize, size: usize) -> Result<VirtAddr, MemoryError> {
        self.heap.calloc(&mut self.paging, count, size)
    }

    pub fn realloc(&mut self, addr: VirtAddr, size: usize) -> Result<VirtAddr, MemoryError> {
        self.heap.realloc(&mut self.paging, addr, size)
    }

    pub fn free(&mut self, addr: VirtAddr) {
        self.heap.free(&mut self.paging, addr)
    }
}

/// The memory subsystem behind a lock, usable as the global allocator:
///
/// ```ignore
/// #[global_allocator]
/// static MEMORY: LockedMemory<LegacyMmu> = LockedMemory::new();
/// ```
///
/// Pointers handed out are virtual addresses of the active address space,
/// so dereferencing them needs an [`Mmu`] whose `virt_ptr` is the identity.
pub struct LockedMemory<M: Mmu> {
    inner: Mutex<Option<Memory<M>>>,
}

impl<M: Mmu> Default for LockedMemory<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmu> LockedMemory<M> {
    pub const fn new() -> Self {
        LockedMemory {
            inner: Mutex::new(None),
        }
    }

    pub fn init(&self, memory: Memory<M>) {
        *self.inner.lock() = Some(memory);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Runs `f` with the memory subsystem locked.
    ///
    /// # Panics
    /// If [`init`](Self::init) has not run.
    pub fn with<R>(&self, f: impl FnOnce(&mut Memory<M>) -> R) -> R {
        let mut guard = self.inner.lock();
        let memory = guard
            .as_mut()
            .unwrap_or_else(|| panic!("memory subsystem used before init"));
        f(memory)
    }
}

fn check_layout(layout: Layout) -> Result<(), MemoryError> {
    if layout.align() > HEAP_GRANULE {
        return Err(MemoryError::UnsupportedAlignment {
            align: layout.align(),
        });
    }
    Ok(())
}

fn to_ptr(result: Result<VirtAddr, MemoryError>) -> *mut u8 {
    result.map_or(null_mut(), |addr| addr.as_mut_ptr())
}

unsafe impl<M: Mmu + Send> GlobalAlloc for LockedMemory<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        to_ptr(self.with(|memory| memory.allocate_layout(layout)))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        to_ptr(check_layout(layout).and_then(|()| self.with(|memory| memory.calloc(1, layout.size()))))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with(|memory| memory.free(VirtAddr::from_ptr(ptr)))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        to_ptr(check_layout(layout).and_then(|()| {
            self.with(|memory| memory.realloc(VirtAddr::from_ptr(ptr), new_size))
        }))
    }
}
