//! The hardware seam of the memory subsystem.
//!
//! Everything above this trait edits page tables as plain memory through the
//! self-referential window; the trait only covers what needs the CPU: the
//! root pointer, translation-cache invalidation, and the pointer through
//! which the kernel reaches a mapped virtual address.

use x86_64::{structures::paging::PhysFrame, VirtAddr};

pub trait Mmu {
    /// Directory frame currently installed in the root pointer.
    fn active_root(&self) -> PhysFrame;

    /// Installs `root` as the active directory. Flushes non-global translations.
    fn load_root(&self, root: PhysFrame);

    /// Invalidates the cached translation of the page containing `addr`.
    fn flush(&self, addr: VirtAddr);

    /// Invalidates every cached translation.
    fn flush_all(&self);

    /// Whether the CPU honours the global bit.
    fn global_pages(&self) -> bool;

    /// Pointer through which the kernel reaches `addr`, given that `addr` is
    /// currently mapped to `frame` in the active address space.
    ///
    /// On real hardware this is `addr` itself; a simulated machine resolves
    /// it through `frame`.
    fn virt_ptr(&self, addr: VirtAddr, frame: PhysFrame) -> *mut u8;
}
