//! Page table manager: mapping, copy-on-write address-space cloning and
//! page-fault resolution on two-level 32-bit page tables.
//!
//! All page-table edits go through a [`Window`]. None of the mapping
//! primitives invalidate translations of the pages they touch; the
//! operations that complete a logical change (clone, destroy, fault
//! resolution) flush before returning, everything else leaves it to the
//! caller.

use core::{fmt, ptr};

use log::{debug, info, trace, warn};
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{
        ADDRESS_SPACE_END, ENTRY_COUNT, FOREIGN_SLOT, KERNEL_AREA_START, KERNEL_SHARED_END, KERNEL_STACK,
        PAGE_SIZE, PRIVATE_SLOT, SELF_SLOT, TEMP_MAP_AREA, TEMP_MAP_AREA_SIZE, TEMP_MAP_PAGE,
        USER_STACK_TOP, USER_TEXT_START,
    },
    memory::{
        cow::CowRegistry,
        entry::{Entry, MAPPING_FLAGS, NO_FREE},
        error::MemoryError,
        frame_allocator::{GlobalFrameAllocator, Pool, PoolMask},
        mmu::Mmu,
        window::{directory_index, Window},
    },
};

/// Handle to an address space: the frame of its page directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    pub fn root(&self) -> PhysFrame {
        self.root
    }
}

/// A run of consecutive pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSpan {
    pub start: VirtAddr,
    pub pages: usize,
}

impl PageSpan {
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let start = self.start;
        (0..self.pages as u64).map(move |page| start + page * PAGE_SIZE)
    }

    /// Directory slots the span touches.
    pub fn table_slots(&self) -> core::ops::Range<usize> {
        if self.pages == 0 {
            return 0..0;
        }
        let last = self.start + (self.pages as u64 - 1) * PAGE_SIZE;
        directory_index(self.start)..directory_index(last) + 1
    }
}

/// User-space layout of a process, as kept by process bookkeeping.
///
/// Text starts at `USER_TEXT_START`, data follows it, and the stack grows
/// down from `USER_STACK_TOP`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segments {
    pub text_pages: usize,
    pub data_pages: usize,
    pub stack_pages: usize,
}

impl Segments {
    pub fn text(&self) -> PageSpan {
        PageSpan {
            start: VirtAddr::new(USER_TEXT_START),
            pages: self.text_pages,
        }
    }

    pub fn data(&self) -> PageSpan {
        PageSpan {
            start: VirtAddr::new(USER_TEXT_START + self.text_pages as u64 * PAGE_SIZE),
            pages: self.data_pages,
        }
    }

    pub fn stack(&self) -> PageSpan {
        PageSpan {
            start: VirtAddr::new(USER_STACK_TOP - self.stack_pages as u64 * PAGE_SIZE),
            pages: self.stack_pages,
        }
    }

    /// Page tables a copy of this layout needs.
    fn table_count(&self) -> usize {
        let image = PageSpan {
            start: VirtAddr::new(USER_TEXT_START),
            pages: self.text_pages + self.data_pages,
        };
        image.table_slots().len() + self.stack().table_slots().len()
    }
}

/// Result of cloning an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClonedSpace {
    pub space: AddressSpace,
    /// Frame backing `KERNEL_STACK` in the new address space.
    pub kernel_stack: PhysFrame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The faulting access can be retried.
    Resolved,
    /// The access was illegal; the fault dispatcher decides what happens.
    Unresolved,
}

pub struct PageTableManager<M: Mmu> {
    frames: GlobalFrameAllocator,
    cow: CowRegistry,
    mmu: M,
    active: AddressSpace,
    kernel_reserved: bool,
    borrowed_pages: usize,
    borrow_next: u64,
}

/// Makes sure `addr` has a page table in `window`.
fn ensure_table<M: Mmu>(
    window: &Window<'_, M>,
    frames: &mut GlobalFrameAllocator,
    kernel_reserved: bool,
    addr: VirtAddr,
) {
    let slot = directory_index(addr);
    if window.directory_entry(slot).is_present() {
        return;
    }
    assert!(
        slot < FOREIGN_SLOT,
        "{:#x} lies in the page-table window",
        addr.as_u64()
    );
    let shared = addr.as_u64() >= KERNEL_AREA_START && addr.as_u64() < KERNEL_SHARED_END;
    assert!(
        !(kernel_reserved && shared),
        "kernel page table for {:#x} missing after reservation",
        addr.as_u64()
    );
    let table = frames.allocate(Pool::Default);
    window.install_table(slot, table, addr.as_u64() < KERNEL_AREA_START);
}

#[allow(clippy::too_many_arguments)]
fn map_pages<M: Mmu>(
    window: &Window<'_, M>,
    frames: &mut GlobalFrameAllocator,
    kernel_reserved: bool,
    virt: VirtAddr,
    source: Option<&[PhysFrame]>,
    count: usize,
    flags: PageTableFlags,
    force: bool,
) {
    assert!(
        MAPPING_FLAGS.contains(flags),
        "unsupported mapping flags {:?}",
        flags
    );
    assert!(virt.is_aligned(PAGE_SIZE), "unaligned mapping at {:#x}", virt.as_u64());
    if let Some(source) = source {
        assert!(source.len() >= count, "{} frames for {} pages", source.len(), count);
    }

    let span = PageSpan { start: virt, pages: count };
    for (index, addr) in span.pages().enumerate() {
        ensure_table(window, frames, kernel_reserved, addr);
        if !force && window.entry(addr).is_present() {
            continue;
        }
        let frame = match source {
            Some(source) => source[index],
            None => frames.allocate(Pool::Default),
        };
        window.set_entry(addr, Entry::page(frame, flags));
    }
}

/// Gives up one mapping's claim on its frame.
fn release_frame(frames: &mut GlobalFrameAllocator, cow: &mut CowRegistry, entry: Entry) {
    if entry.is_no_free() || (entry.is_cow() && !cow.release(entry.frame())) {
        return;
    }
    frames.free(entry.frame(), Pool::Default);
}

fn unmap_pages<M: Mmu>(
    window: &Window<'_, M>,
    frames: &mut GlobalFrameAllocator,
    cow: &mut CowRegistry,
    virt: VirtAddr,
    count: usize,
    free_frames: bool,
) {
    let span = PageSpan { start: virt, pages: count };
    for addr in span.pages() {
        let entry = window.entry(addr);
        if !entry.is_present() {
            continue;
        }
        window.set_entry(addr, Entry::ABSENT);
        if free_frames {
            release_frame(frames, cow, entry);
        }
    }
}

/// Runs `f` with `frame` mapped at `TEMP_MAP_PAGE` of the active address space.
fn with_temp_page<M: Mmu, R>(
    mmu: &M,
    window: &Window<'_, M>,
    frame: PhysFrame,
    f: impl FnOnce(*mut u8) -> R,
) -> R {
    let temp = VirtAddr::new(TEMP_MAP_PAGE);
    debug_assert!(!window.is_foreign());
    window.set_entry(temp, Entry::page(frame, PageTableFlags::WRITABLE));
    mmu.flush(temp);
    let result = f(mmu.virt_ptr(temp, frame));
    window.set_entry(temp, Entry::ABSENT);
    mmu.flush(temp);
    result
}

impl<M: Mmu> PageTableManager<M> {
    /// Takes over the address space the boot code left active.
    ///
    /// The active directory must already map itself in its last slot.
    pub fn new(frames: GlobalFrameAllocator, cow: CowRegistry, mmu: M) -> Self {
        let active = AddressSpace {
            root: mmu.active_root(),
        };
        let mut paging = PageTableManager {
            frames,
            cow,
            mmu,
            active,
            kernel_reserved: false,
            borrowed_pages: 0,
            borrow_next: TEMP_MAP_AREA,
        };
        {
            let window = Window::active(&paging.mmu, paging.active.root);
            ensure_table(&window, &mut paging.frames, false, VirtAddr::new(TEMP_MAP_PAGE));
        }
        paging
    }

    pub fn frames(&self) -> &GlobalFrameAllocator {
        &self.frames
    }

    /// Raw frame bookkeeping for collaborators such as process teardown.
    pub fn frames_mut(&mut self) -> &mut GlobalFrameAllocator {
        &mut self.frames
    }

    pub fn cow(&self) -> &CowRegistry {
        &self.cow
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn active(&self) -> AddressSpace {
        self.active
    }

    pub fn activate(&mut self, space: AddressSpace) {
        if space != self.active {
            self.mmu.load_root(space.root);
            self.active = space;
        }
    }

    /// Creates every kernel page table up front, so all address spaces cloned
    /// later alias the same kernel tables.
    pub fn reserve_kernel_space(&mut self) {
        let first = directory_index(VirtAddr::new(KERNEL_AREA_START));
        let window = Window::active(&self.mmu, self.active.root);
        let mut created = 0;
        for slot in first..PRIVATE_SLOT {
            if !window.directory_entry(slot).is_present() {
                let table = self.frames.allocate(Pool::Default);
                window.install_table(slot, table, false);
                created += 1;
            }
        }
        self.kernel_reserved = true;
        info!("Reserved {} kernel page tables", created);
    }

    /// Maps `count` pages at `virt` in the active address space.
    ///
    /// Without `frames`, each page gets a fresh default-pool frame with
    /// whatever it held before. Present pages are kept unless `force` is set.
    /// Nothing is flushed.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        frames: Option<&[PhysFrame]>,
        count: usize,
        flags: PageTableFlags,
        force: bool,
    ) {
        let window = Window::active(&self.mmu, self.active.root);
        map_pages(&window, &mut self.frames, self.kernel_reserved, virt, frames, count, flags, force);
    }

    /// [`map`](Self::map) into any address space.
    pub fn map_into(
        &mut self,
        space: AddressSpace,
        virt: VirtAddr,
        frames: Option<&[PhysFrame]>,
        count: usize,
        flags: PageTableFlags,
        force: bool,
    ) {
        let window = Window::open(&self.mmu, self.active.root, space.root);
        map_pages(&window, &mut self.frames, self.kernel_reserved, virt, frames, count, flags, force);
    }

    /// Removes `count` mappings at `virt` in the active address space.
    ///
    /// With `free_frames`, frames go back to the default pool; a copy-on-write
    /// frame is only freed once its last mapping goes, and a no-free frame
    /// never is. Page tables stay, and
    /// nothing is flushed.
    pub fn unmap(&mut self, virt: VirtAddr, count: usize, free_frames: bool) {
        let window = Window::active(&self.mmu, self.active.root);
        unmap_pages(&window, &mut self.frames, &mut self.cow, virt, count, free_frames);
    }

    pub fn unmap_from(&mut self, space: AddressSpace, virt: VirtAddr, count: usize, free_frames: bool) {
        let window = Window::open(&self.mmu, self.active.root, space.root);
        unmap_pages(&window, &mut self.frames, &mut self.cow, virt, count, free_frames);
    }

    /// Frees the page tables of `[virt, virt + count pages)` that no longer
    /// map anything.
    pub fn unmap_page_tables(&mut self, virt: VirtAddr, count: usize) {
        let span = PageSpan { start: virt, pages: count };
        let window = Window::active(&self.mmu, self.active.root);
        let mut removed = 0;
        for slot in span.table_slots() {
            let shared = slot >= directory_index(VirtAddr::new(KERNEL_AREA_START)) && slot < PRIVATE_SLOT;
            assert!(!shared, "kernel page tables are shared and never reclaimed");
            if window.present_entries(slot).next().is_some() {
                continue;
            }
            if let Some(table) = window.remove_table(slot) {
                self.frames.free(table, Pool::Default);
                removed += 1;
            }
        }
        if removed > 0 {
            self.mmu.flush_all();
        }
    }

    /// Frames a `map` of `count` fresh pages at `virt` would take.
    pub fn frames_needed_to_map(&self, virt: VirtAddr, count: usize) -> usize {
        let span = PageSpan { start: virt, pages: count };
        let window = Window::active(&self.mmu, self.active.root);
        let tables = span
            .table_slots()
            .filter(|&slot| !window.directory_entry(slot).is_present())
            .count();
        let pages = span.pages().filter(|&addr| !window.entry(addr).is_present()).count();
        tables + pages
    }

    pub fn flush_range(&self, virt: VirtAddr, count: usize) {
        let span = PageSpan { start: virt, pages: count };
        for addr in span.pages() {
            self.mmu.flush(addr);
        }
    }

    pub fn global_pages(&self) -> bool {
        self.mmu.global_pages()
    }

    pub(crate) fn active_entry(&self, virt: VirtAddr) -> Entry {
        Window::active(&self.mmu, self.active.root).entry(virt)
    }

    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.active_entry(virt).is_present()
    }

    pub fn frame_of(&self, virt: VirtAddr) -> Option<PhysFrame> {
        let entry = self.active_entry(virt);
        entry.is_present().then(|| entry.frame())
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.frame_of(virt)
            .map(|frame| frame.start_address() + u64::from(virt.page_offset()))
    }

    /// Pages covering `[virt, virt + len)`, or `None` if the range wraps or,
    /// for user access, reaches into kernel space.
    fn checked_span(virt: VirtAddr, len: u64, user: bool) -> Option<PageSpan> {
        let end = virt.as_u64().checked_add(len)?;
        let limit = if user { KERNEL_AREA_START } else { ADDRESS_SPACE_END };
        if end > limit {
            return None;
        }
        let start = virt.align_down(PAGE_SIZE);
        let pages = (end - start.as_u64()).div_ceil(PAGE_SIZE);
        Some(PageSpan { start, pages: pages as usize })
    }

    pub fn is_range_readable(&self, virt: VirtAddr, len: u64, user: bool) -> bool {
        let Some(span) = Self::checked_span(virt, len, user) else {
            return false;
        };
        span.pages().all(|addr| {
            let entry = self.active_entry(addr);
            entry.is_present() && (!user || entry.is_user())
        })
    }

    /// Like [`is_range_readable`](Self::is_range_readable), but also resolves
    /// copy-on-write pages, so the whole range is writable on return.
    pub fn is_range_writable(&mut self, virt: VirtAddr, len: u64, user: bool) -> bool {
        let Some(span) = Self::checked_span(virt, len, user) else {
            return false;
        };
        span.pages().all(|addr| {
            let entry = self.active_entry(addr);
            if !entry.is_present() || (user && !entry.is_user()) {
                return false;
            }
            entry.is_writable()
                || (entry.is_cow() && self.handle_page_fault(addr, true) == FaultResolution::Resolved)
        })
    }

    /// Kernel pointer to the byte at `virt` of the active address space.
    ///
    /// # Panics
    /// If `virt` is not mapped.
    pub(crate) fn kernel_ptr(&self, virt: VirtAddr) -> *mut u8 {
        let frame = self
            .frame_of(virt)
            .unwrap_or_else(|| panic!("kernel access to unmapped address {:#x}", virt.as_u64()));
        self.mmu.virt_ptr(virt, frame)
    }

    /// Splits `[virt, virt + len)` at page boundaries.
    fn chunks(virt: VirtAddr, len: usize) -> impl Iterator<Item = (VirtAddr, usize)> {
        let end = virt.as_u64() + len as u64;
        let mut next = virt.as_u64();
        core::iter::from_fn(move || {
            if next >= end {
                return None;
            }
            let chunk = (PAGE_SIZE - next % PAGE_SIZE).min(end - next);
            let addr = VirtAddr::new(next);
            next += chunk;
            Some((addr, chunk as usize))
        })
    }

    pub fn read_bytes(&self, virt: VirtAddr, buf: &mut [u8]) {
        let mut done = 0;
        for (addr, len) in Self::chunks(virt, buf.len()) {
            unsafe { ptr::copy_nonoverlapping(self.kernel_ptr(addr), buf[done..].as_mut_ptr(), len) };
            done += len;
        }
    }

    pub fn write_bytes(&self, virt: VirtAddr, data: &[u8]) {
        let mut done = 0;
        for (addr, len) in Self::chunks(virt, data.len()) {
            unsafe { ptr::copy_nonoverlapping(data[done..].as_ptr(), self.kernel_ptr(addr), len) };
            done += len;
        }
    }

    pub fn fill_bytes(&self, virt: VirtAddr, value: u8, len: usize) {
        for (addr, len) in Self::chunks(virt, len) {
            unsafe { ptr::write_bytes(self.kernel_ptr(addr), value, len) };
        }
    }

    /// Copies `len` bytes between two non-overlapping kernel ranges.
    pub fn copy_bytes(&self, dst: VirtAddr, src: VirtAddr, len: usize) {
        let mut done = 0u64;
        while done < len as u64 {
            let (d, s) = (dst + done, src + done);
            let chunk = (PAGE_SIZE - d.as_u64() % PAGE_SIZE)
                .min(PAGE_SIZE - s.as_u64() % PAGE_SIZE)
                .min(len as u64 - done);
            unsafe { ptr::copy_nonoverlapping(self.kernel_ptr(s), self.kernel_ptr(d), chunk as usize) };
            done += chunk;
        }
    }

    /// Builds a new directory sharing the kernel half of the active one.
    fn new_directory(&mut self) -> PhysFrame {
        let directory = self.frames.allocate(Pool::Default);
        let kernel_first = directory_index(VirtAddr::new(KERNEL_AREA_START));
        let window = Window::active(&self.mmu, self.active.root);
        with_temp_page(&self.mmu, &window, directory, |page| {
            let entries = page.cast::<u32>();
            for slot in 0..ENTRY_COUNT {
                let entry = match slot {
                    slot if slot < kernel_first => Entry::ABSENT,
                    PRIVATE_SLOT | FOREIGN_SLOT => Entry::ABSENT,
                    SELF_SLOT => Entry::table(directory, false),
                    slot => window.directory_entry(slot),
                };
                unsafe { ptr::write_volatile(entries.add(slot), entry.raw()) };
            }
        });
        directory
    }

    /// Clones `source` for a fork.
    ///
    /// Text is shared read-only, data and stack pages become copy-on-write in
    /// both address spaces, and the clone gets its own kernel stack page.
    /// No-free mappings are shared unchanged.
    /// Fails without side effects if the default pool cannot cover the new
    /// directory, tables and kernel stack.
    pub fn clone_address_space(
        &mut self,
        source: AddressSpace,
        segments: &Segments,
    ) -> Result<ClonedSpace, MemoryError> {
        let previous = self.active;
        self.activate(source);
        let result = self.clone_active(segments);
        self.activate(previous);
        result
    }

    fn clone_active(&mut self, segments: &Segments) -> Result<ClonedSpace, MemoryError> {
        // directory, private table and kernel stack
        let needed = 3 + segments.table_count();
        let available = self.frames.free_count(PoolMask::DEFAULT);
        if available < needed {
            warn!("Cannot clone address space: {} frames needed, {} free", needed, available);
            return Err(MemoryError::OutOfFrames { needed, available });
        }

        let directory = self.new_directory();
        let parent = Window::active(&self.mmu, self.active.root);
        let child = Window::open(&self.mmu, self.active.root, directory);

        let table = self.frames.allocate(Pool::Default);
        child.install_table(PRIVATE_SLOT, table, false);
        let kernel_stack = self.frames.allocate(Pool::Default);
        child.set_entry(
            VirtAddr::new(KERNEL_STACK),
            Entry::page(kernel_stack, PageTableFlags::WRITABLE),
        );

        for addr in segments.text().pages() {
            let entry = parent.entry(addr);
            if !entry.is_present() {
                continue;
            }
            let flags = entry.flags() & (PageTableFlags::USER_ACCESSIBLE | NO_FREE);
            ensure_table(&child, &mut self.frames, self.kernel_reserved, addr);
            child.set_entry(addr, Entry::page(entry.frame(), flags));
        }

        let private = segments.data().pages().chain(segments.stack().pages());
        for addr in private {
            let entry = parent.entry(addr);
            if !entry.is_present() {
                continue;
            }
            ensure_table(&child, &mut self.frames, self.kernel_reserved, addr);
            // device memory stays shared and writable in both
            if entry.is_no_free() {
                child.set_entry(addr, entry);
                continue;
            }
            let shared = entry.make_cow();
            if shared != entry {
                parent.set_entry(addr, shared);
            }
            self.cow.share(entry.frame());
            child.set_entry(addr, shared);
        }

        drop(child);
        drop(parent);
        self.mmu.flush_all();

        debug!(
            "Cloned address space {:#x} into {:#x}",
            self.active.root.start_address().as_u64(),
            directory.start_address().as_u64()
        );
        Ok(ClonedSpace {
            space: AddressSpace { root: directory },
            kernel_stack,
        })
    }

    /// Tears down an inactive address space.
    ///
    /// Every user mapping lets go of its frame: copy-on-write frames are
    /// freed with their last owner, text frames only if `release_text` says
    /// this was the last user of the text. Then the tables, the kernel stack
    /// and finally the directory are freed.
    pub fn destroy_address_space(&mut self, space: AddressSpace, segments: &Segments, release_text: bool) {
        assert_ne!(space, self.active, "cannot destroy the active address space");
        let text = segments.text();
        let text_end = text.start + text.pages as u64 * PAGE_SIZE;
        let user_slots = 0..directory_index(VirtAddr::new(KERNEL_AREA_START));

        let window = Window::open(&self.mmu, self.active.root, space.root);
        for slot in user_slots.chain(PRIVATE_SLOT..PRIVATE_SLOT + 1) {
            for (addr, entry) in window.present_entries(slot) {
                window.set_entry(addr, Entry::ABSENT);
                let in_text = addr >= text.start && addr < text_end;
                if !in_text || release_text {
                    release_frame(&mut self.frames, &mut self.cow, entry);
                }
            }
            if let Some(table) = window.remove_table(slot) {
                self.frames.free(table, Pool::Default);
            }
        }
        drop(window);

        self.frames.free(space.root, Pool::Default);
        debug!("Destroyed address space {:#x}", space.root.start_address().as_u64());
    }

    /// Resolves a fault at `virt` in the active address space.
    pub fn handle_page_fault(&mut self, virt: VirtAddr, is_write: bool) -> FaultResolution {
        let window = Window::active(&self.mmu, self.active.root);
        let entry = window.entry(virt);
        if !entry.is_present() || !entry.is_cow() {
            return FaultResolution::Unresolved;
        }
        if !is_write {
            return FaultResolution::Resolved;
        }

        let page = virt.align_down(PAGE_SIZE);
        let frame = entry.frame();
        if self.cow.owners(frame) == 1 {
            window.set_entry(page, entry.resolve_cow());
            trace!("Took over copy-on-write page {:#x}", page.as_u64());
        } else {
            let copy = self.frames.allocate(Pool::Default);
            let mmu = &self.mmu;
            with_temp_page(mmu, &window, frame, |original| {
                window.set_entry(page, entry.resolve_cow().with_frame(copy));
                mmu.flush(page);
                unsafe {
                    ptr::copy_nonoverlapping(original, mmu.virt_ptr(page, copy), PAGE_SIZE as usize)
                };
            });
            self.cow.release(frame);
            trace!("Copied copy-on-write page {:#x}", page.as_u64());
        }
        self.mmu.flush(page);
        FaultResolution::Resolved
    }

    /// Maps the pages holding `[virt, virt + size)` of `space` into the
    /// temporary area of the active address space and returns where `virt`
    /// landed. `None` if any of those pages is absent.
    pub fn map_area_of(&mut self, space: AddressSpace, virt: VirtAddr, size: u64) -> Option<VirtAddr> {
        let span = Self::checked_span(virt, size, false)?;
        let end = self.borrow_next + span.pages as u64 * PAGE_SIZE;
        assert!(end <= TEMP_MAP_AREA + TEMP_MAP_AREA_SIZE, "temporary map area exhausted");

        let active = Window::active(&self.mmu, self.active.root);
        let foreign = Window::open(&self.mmu, self.active.root, space.root);
        if !span.pages().all(|addr| foreign.entry(addr).is_present()) {
            return None;
        }
        let target = VirtAddr::new(self.borrow_next);
        for (index, addr) in span.pages().enumerate() {
            let dest = target + index as u64 * PAGE_SIZE;
            ensure_table(&active, &mut self.frames, self.kernel_reserved, dest);
            active.set_entry(dest, Entry::page(foreign.entry(addr).frame(), PageTableFlags::WRITABLE));
        }
        self.borrow_next = end;
        self.borrowed_pages += span.pages;
        Some(target + u64::from(virt.page_offset()))
    }

    /// Returns pages borrowed with [`map_area_of`](Self::map_area_of).
    pub fn unmap_area(&mut self, virt: VirtAddr, size: u64) {
        let Some(span) = Self::checked_span(virt, size, false) else {
            return;
        };
        assert!(
            span.start.as_u64() >= TEMP_MAP_AREA && span.pages <= self.borrowed_pages,
            "{:#x} was not borrowed",
            virt.as_u64()
        );
        self.unmap(span.start, span.pages, false);
        self.flush_range(span.start, span.pages);
        self.borrowed_pages -= span.pages;
        if self.borrowed_pages == 0 {
            self.borrow_next = TEMP_MAP_AREA;
        }
    }

    /// Displays the user mappings of `space`.
    pub fn dump(&self, space: AddressSpace) -> AddressSpaceDump<'_, M> {
        AddressSpaceDump { paging: self, space }
    }
}

pub struct AddressSpaceDump<'a, M: Mmu> {
    paging: &'a PageTableManager<M>,
    space: AddressSpace,
}

impl<M: Mmu> fmt::Display for AddressSpaceDump<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paging = self.paging;
        let window = Window::open(&paging.mmu, paging.active.root, self.space.root);
        writeln!(f, "Address space {:#x}:", self.space.root.start_address().as_u64())?;
        for slot in 0..directory_index(VirtAddr::new(KERNEL_AREA_START)) {
            for (addr, entry) in window.present_entries(slot) {
                writeln!(
                    f,
                    "  {:#010x} -> {:#010x} {}{}{}{}",
                    addr.as_u64(),
                    entry.frame().start_address().as_u64(),
                    if entry.is_writable() { 'w' } else { 'r' },
                    if entry.is_user() { 'u' } else { 's' },
                    if entry.is_cow() { " cow" } else { "" },
                    if entry.is_no_free() { " nofree" } else { "" },
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        entry::COPY_ON_WRITE,
        testing::machine,
    };

    const USER_RW: PageTableFlags = PageTableFlags::WRITABLE.union(PageTableFlags::USER_ACCESSIBLE);

    fn addr(value: u64) -> VirtAddr {
        VirtAddr::new(value)
    }

    fn read_u32(paging: &PageTableManager<impl Mmu>, virt: VirtAddr) -> u32 {
        let mut bytes = [0u8; 4];
        paging.read_bytes(virt, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(paging: &PageTableManager<impl Mmu>, virt: VirtAddr, value: u32) {
        paging.write_bytes(virt, &value.to_le_bytes());
    }

    #[test]
    fn test_map_unmap_round_trip_restores_frames() {
        let mut paging = machine();
        let virt = addr(0x4000_0000);
        paging.map(virt, None, 8, USER_RW, true);
        let before = paging.frames().free_count(PoolMask::DEFAULT);

        paging.map(virt + 8 * PAGE_SIZE, None, 16, USER_RW, true);
        for page in 8..24 {
            assert!(paging.is_mapped(virt + page * PAGE_SIZE));
        }
        paging.unmap(virt + 8 * PAGE_SIZE, 16, true);

        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before);
        for page in 8..24 {
            assert!(!paging.is_mapped(virt + page * PAGE_SIZE));
        }
    }

    #[test]
    fn test_map_without_force_keeps_present_pages() {
        let mut paging = machine();
        let virt = addr(0x0800_0000);
        paging.map(virt, None, 1, USER_RW, false);
        let frame = paging.frame_of(virt).unwrap();
        let free = paging.frames().free_count(PoolMask::ALL);

        paging.map(virt, None, 1, USER_RW, false);
        assert_eq!(paging.frame_of(virt), Some(frame));
        assert_eq!(paging.frames().free_count(PoolMask::ALL), free);

        let other = paging.frames_mut().allocate(Pool::Default);
        paging.map(virt, Some(&[other]), 1, USER_RW, true);
        assert_eq!(paging.frame_of(virt), Some(other));
    }

    #[test]
    fn test_map_does_not_flush_existing_tables() {
        let mut paging = machine();
        let virt = addr(0x0040_0000);
        paging.map(virt, None, 1, USER_RW, true);
        let flushes = (paging.mmu().flush_count(), paging.mmu().full_flush_count());

        paging.map(virt + PAGE_SIZE, None, 32, USER_RW, true);
        paging.unmap(virt, 33, true);
        assert_eq!((paging.mmu().flush_count(), paging.mmu().full_flush_count()), flushes);
    }

    #[test]
    fn test_missing_table_comes_from_default_pool_zeroed() {
        let mut paging = machine();
        let virt = addr(0x1000_0000);
        assert_eq!(paging.frames_needed_to_map(virt, 3), 4);
        let before = paging.frames().free_count(PoolMask::DEFAULT);
        paging.map(virt, None, 3, USER_RW, true);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before - 4);
        assert!(!paging.is_mapped(virt + 3 * PAGE_SIZE));
        assert_eq!(paging.frames_needed_to_map(virt, 3), 0);
    }

    #[test]
    fn test_unmap_page_tables_frees_empty_tables() {
        let mut paging = machine();
        let virt = addr(0x2000_0000);
        let before = paging.frames().free_count(PoolMask::DEFAULT);
        paging.map(virt, None, 2, USER_RW, true);
        paging.unmap(virt, 2, true);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before - 1);
        paging.unmap_page_tables(virt, 2);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before);
    }

    #[test]
    #[should_panic(expected = "wrong pool")]
    fn test_unmap_never_frees_into_low_pool() {
        let mut paging = machine();
        let low = paging.frames_mut().allocate(Pool::Low);
        paging.map(addr(0x0100_0000), Some(&[low]), 1, USER_RW, true);
        paging.unmap(addr(0x0100_0000), 1, true);
    }

    #[test]
    #[should_panic(expected = "unsupported mapping flags")]
    fn test_map_rejects_hardware_only_flags() {
        let mut paging = machine();
        paging.map(addr(0x0100_0000), None, 1, PageTableFlags::HUGE_PAGE, true);
    }

    #[test]
    fn test_range_checks() {
        let mut paging = machine();
        let virt = addr(0x0200_0000);
        paging.map(virt, None, 2, USER_RW, true);
        paging.map(virt + 2 * PAGE_SIZE, None, 1, PageTableFlags::USER_ACCESSIBLE, true);
        paging.map(virt + 3 * PAGE_SIZE, None, 1, PageTableFlags::WRITABLE, true);

        assert!(paging.is_range_readable(virt + 100, 2 * PAGE_SIZE, true));
        assert!(paging.is_range_writable(virt + 100, PAGE_SIZE, true));
        assert!(!paging.is_range_writable(virt, 3 * PAGE_SIZE, true));
        assert!(!paging.is_range_readable(virt, 4 * PAGE_SIZE, true));
        assert!(paging.is_range_readable(virt, 4 * PAGE_SIZE, false));
        assert!(!paging.is_range_readable(virt, 5 * PAGE_SIZE, false));
        assert!(!paging.is_range_readable(addr(KERNEL_AREA_START - 8), 16, true));
        assert!(!paging.is_range_readable(addr(0xFFFF_FFF0), u64::MAX, false));
    }

    #[test]
    fn test_fault_on_absent_or_read_only_page_is_unresolved() {
        let mut paging = machine();
        let virt = addr(0x0300_0000);
        assert_eq!(paging.handle_page_fault(virt, false), FaultResolution::Unresolved);
        paging.map(virt, None, 1, PageTableFlags::USER_ACCESSIBLE, true);
        assert_eq!(paging.handle_page_fault(virt, true), FaultResolution::Unresolved);
    }

    #[test]
    fn test_sole_owner_cow_fault_resolves_in_place() {
        let mut paging = machine();
        let virt = addr(0x0300_0000);
        paging.map(virt, None, 1, USER_RW | COPY_ON_WRITE, true);
        let frame = paging.frame_of(virt).unwrap();
        let free = paging.frames().free_count(PoolMask::ALL);

        assert_eq!(paging.handle_page_fault(virt + 12, false), FaultResolution::Resolved);
        assert!(paging.active_entry(virt).is_cow());
        assert_eq!(paging.handle_page_fault(virt + 12, true), FaultResolution::Resolved);
        assert_eq!(paging.frame_of(virt), Some(frame));
        assert!(paging.active_entry(virt).is_writable());
        assert_eq!(paging.frames().free_count(PoolMask::ALL), free);
    }

    fn five_page_process(paging: &mut PageTableManager<impl Mmu>) -> (Segments, VirtAddr) {
        let segments = Segments {
            text_pages: 1,
            data_pages: 5,
            stack_pages: 2,
        };
        let mut frames = [PhysFrame::containing_address(PhysAddr::zero()); 5];
        paging.frames_mut().allocate_many(Pool::Default, &mut frames);
        let data = segments.data().start;
        paging.map(data, Some(&frames), 5, USER_RW, true);
        paging.map(segments.text().start, None, 1, PageTableFlags::USER_ACCESSIBLE, true);
        paging.map(segments.stack().start, None, 2, USER_RW, true);
        (segments, data)
    }

    #[test]
    fn test_fork_write_and_destroy_scenario() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, data) = five_page_process(&mut paging);
        let last = data + 4 * PAGE_SIZE;
        write_u32(&paging, data, 0xDEAD_BEEF);
        write_u32(&paging, last + 0xFFC, 0x1234_5678);

        let before_clone = paging.frames().free_count(PoolMask::DEFAULT);
        let clone = paging.clone_address_space(parent, &segments).unwrap();
        assert_eq!(paging.active(), parent);

        paging.activate(clone.space);
        assert_eq!(read_u32(&paging, data), 0xDEAD_BEEF);
        assert_eq!(read_u32(&paging, last + 0xFFC), 0x1234_5678);
        let shared = paging.frame_of(data).unwrap();
        assert_eq!(paging.cow().owners(shared), 2);

        assert!(paging.is_range_writable(data, 4, true));
        write_u32(&paging, data, 0x0BAD_F00D);
        assert_ne!(paging.frame_of(data), Some(shared));
        assert_eq!(paging.cow().owners(shared), 1);

        paging.activate(parent);
        assert_eq!(read_u32(&paging, data), 0xDEAD_BEEF);
        assert_eq!(paging.frame_of(data), Some(shared));

        paging.destroy_address_space(clone.space, &segments, false);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before_clone);
        assert_eq!(paging.cow().shared_frames(), 0);

        // the parent is now the only owner and takes its pages back without copying
        let free = paging.frames().free_count(PoolMask::DEFAULT);
        assert_eq!(paging.handle_page_fault(last, true), FaultResolution::Resolved);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), free);
        write_u32(&paging, last, 7);
    }

    #[test]
    fn test_clone_shares_text_and_kernel_tables() {
        let mut paging = machine();
        paging.reserve_kernel_space();
        let parent = paging.active();
        let (segments, _) = five_page_process(&mut paging);
        let text = segments.text().start;
        let text_frame = paging.frame_of(text).unwrap();

        let clone = paging.clone_address_space(parent, &segments).unwrap();
        paging.activate(clone.space);
        assert_eq!(paging.frame_of(text), Some(text_frame));
        assert_eq!(paging.handle_page_fault(text, true), FaultResolution::Unresolved);
        assert_eq!(paging.frame_of(VirtAddr::new(KERNEL_STACK)), Some(clone.kernel_stack));

        // kernel mappings made in one address space show up in the other
        paging.map(addr(0xD000_0000), None, 1, PageTableFlags::WRITABLE, true);
        let kernel_frame = paging.frame_of(addr(0xD000_0000));
        paging.activate(parent);
        assert_eq!(paging.frame_of(addr(0xD000_0000)), kernel_frame);
        assert_ne!(paging.frame_of(VirtAddr::new(KERNEL_STACK)), Some(clone.kernel_stack));
    }

    #[test]
    fn test_grandchild_keeps_counts_straight() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, data) = five_page_process(&mut paging);
        let frame = paging.frame_of(data).unwrap();
        let before = paging.frames().free_count(PoolMask::DEFAULT);

        let child = paging.clone_address_space(parent, &segments).unwrap();
        let grandchild = paging.clone_address_space(child.space, &segments).unwrap();
        assert_eq!(paging.cow().owners(frame), 3);

        paging.destroy_address_space(child.space, &segments, false);
        assert_eq!(paging.cow().owners(frame), 2);
        paging.destroy_address_space(grandchild.space, &segments, false);
        assert_eq!(paging.cow().owners(frame), 1);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before);
    }

    #[test]
    fn test_clone_fails_cleanly_without_frames() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, data) = five_page_process(&mut paging);
        let spare = paging.frames().free_count(PoolMask::DEFAULT) - 2;
        let mut hog = vec![PhysFrame::containing_address(PhysAddr::zero()); spare];
        paging.frames_mut().allocate_many(Pool::Default, &mut hog);

        let result = paging.clone_address_space(parent, &segments);
        assert_eq!(
            result,
            Err(MemoryError::OutOfFrames { needed: 5, available: 2 })
        );
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), 2);
        assert!(!paging.active_entry(data).is_cow());
    }

    #[test]
    fn test_destroy_releases_text_on_request() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, _) = five_page_process(&mut paging);
        let before = paging.frames().free_count(PoolMask::DEFAULT);
        let clone = paging.clone_address_space(parent, &segments).unwrap();
        let text_frame = paging.frame_of(segments.text().start).unwrap();

        paging.destroy_address_space(clone.space, &segments, true);
        // the text frame was freed along with everything the clone owned
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before + 1);
        paging.unmap(segments.text().start, 1, false);
        let mut reused = false;
        for _ in 0..paging.frames().free_count(PoolMask::DEFAULT) {
            reused |= paging.frames_mut().allocate(Pool::Default) == text_frame;
        }
        assert!(reused);
    }

    #[test]
    fn test_borrowed_pages_alias_foreign_frames() {
        let mut paging = machine();
        paging.reserve_kernel_space();
        let parent = paging.active();
        let (segments, data) = five_page_process(&mut paging);
        let clone = paging.clone_address_space(parent, &segments).unwrap();

        let window = paging.map_area_of(clone.space, data + 0x10, 2 * PAGE_SIZE).unwrap();
        assert_eq!(window.as_u64() & 0xFFF, 0x10);
        assert_eq!(paging.frame_of(window), paging.frame_of(data));
        paging.unmap_area(window, 2 * PAGE_SIZE);
        assert!(!paging.is_mapped(window));

        assert_eq!(paging.map_area_of(clone.space, addr(0x7000_0000), 4), None);
    }

    #[test]
    fn test_parent_writes_stay_out_of_the_child() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, data) = five_page_process(&mut paging);
        let stack = segments.stack().start;
        write_u32(&paging, data + 8, 11);
        write_u32(&paging, stack, 22);

        let clone = paging.clone_address_space(parent, &segments).unwrap();
        assert!(paging.is_range_writable(data + 8, 4, true));
        write_u32(&paging, data + 8, 99);
        assert_eq!(paging.handle_page_fault(stack, true), FaultResolution::Resolved);
        write_u32(&paging, stack, 88);

        paging.activate(clone.space);
        assert_eq!(read_u32(&paging, data + 8), 11);
        assert_eq!(read_u32(&paging, stack), 22);
        paging.activate(parent);
        assert_eq!(read_u32(&paging, data + 8), 99);
        assert_eq!(read_u32(&paging, stack), 88);
    }

    #[test]
    fn test_device_mappings_are_shared_and_never_freed() {
        let mut paging = machine();
        let parent = paging.active();
        let segments = Segments {
            text_pages: 1,
            data_pages: 2,
            stack_pages: 1,
        };
        let data = segments.data().start;
        let device = PhysFrame::containing_address(PhysAddr::new(0x0F00_0000));
        paging.map(segments.text().start, None, 1, PageTableFlags::USER_ACCESSIBLE, true);
        paging.map(data, None, 1, USER_RW, true);
        paging.map(data + PAGE_SIZE, Some(&[device]), 1, USER_RW | NO_FREE, true);
        paging.map(segments.stack().start, None, 1, USER_RW, true);
        let before = paging.frames().free_count(PoolMask::ALL);

        let clone = paging.clone_address_space(parent, &segments).unwrap();
        let shared = paging.active_entry(data + PAGE_SIZE);
        assert_eq!(shared.frame(), device);
        assert!(shared.is_writable() && !shared.is_cow());
        assert!(paging.active_entry(data).is_cow());

        paging.activate(clone.space);
        let copy = paging.active_entry(data + PAGE_SIZE);
        assert_eq!(copy, shared);
        assert!(paging.is_range_writable(data + PAGE_SIZE, 4, true));
        paging.activate(parent);

        paging.destroy_address_space(clone.space, &segments, false);
        assert_eq!(paging.frames().free_count(PoolMask::ALL), before);

        paging.unmap(data + PAGE_SIZE, 1, true);
        assert!(!paging.is_mapped(data + PAGE_SIZE));
        assert_eq!(paging.frames().free_count(PoolMask::ALL), before);
    }

    #[test]
    fn test_map_into_and_unmap_from_reach_an_inactive_space() {
        let mut paging = machine();
        let parent = paging.active();
        let other = paging.clone_address_space(parent, &Segments::default()).unwrap().space;
        let virt = addr(0x5000_0000);
        let before = paging.frames().free_count(PoolMask::DEFAULT);

        paging.map_into(other, virt, None, 2, USER_RW, true);
        assert_eq!(paging.active(), parent);
        assert!(!paging.is_mapped(virt));
        // one table and two pages
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before - 3);

        paging.activate(other);
        assert!(paging.is_mapped(virt) && paging.is_mapped(virt + PAGE_SIZE));
        write_u32(&paging, virt + PAGE_SIZE, 0xFEED);
        paging.activate(parent);

        paging.unmap_from(other, virt, 2, true);
        assert_eq!(paging.frames().free_count(PoolMask::DEFAULT), before - 1);
        paging.activate(other);
        assert!(!paging.is_mapped(virt));
        paging.activate(parent);
        paging.destroy_address_space(other, &Segments::default(), false);
    }

    #[test]
    fn test_dump_lists_user_mappings() {
        let mut paging = machine();
        let parent = paging.active();
        let (segments, _) = five_page_process(&mut paging);
        let clone = paging.clone_address_space(parent, &segments).unwrap();
        let dump = format!("{}", paging.dump(clone.space));
        assert_eq!(dump.lines().count(), 1 + 1 + 5 + 2);
        assert_eq!(dump.matches(" cow").count(), 7);
    }
}
