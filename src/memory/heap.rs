//! The Kernel Heap
//!
//! A first-fit allocator over a fixed virtual range, backed page by page as
//! areas are handed out and given back as they are freed.
//!
//! The range starts with an arena of fixed-size area nodes, followed by the
//! payload. Nodes form an address-ordered list that partitions the payload
//! exactly; the last node is the sentinel, the unbounded free tail. Arena
//! pages are mapped when their first node is taken and unmapped when their
//! last node is released.

use core::ptr;

use log::{trace, warn};
use x86_64::{structures::paging::PageTableFlags, VirtAddr};

use crate::{
    constants::memory::{HEAP_GRANULE, PAGE_SIZE},
    memory::{error::MemoryError, frame_allocator::PoolMask, mmu::Mmu, paging::PageTableManager},
};

const NIL: u32 = u32::MAX;
const NODE_SIZE: usize = core::mem::size_of::<AreaNode>();
const SLOTS_PER_PAGE: usize = PAGE_SIZE as usize / NODE_SIZE;
/// Upper bound on arena pages; an arena of this size covers a 16 MiB heap.
pub const MAX_ARENA_PAGES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaKind {
    Free,
    Occupied,
    Sentinel,
}

const UNUSED: u32 = 0;

impl AreaKind {
    fn from_raw(raw: u32) -> Option<AreaKind> {
        match raw {
            1 => Some(AreaKind::Free),
            2 => Some(AreaKind::Occupied),
            3 => Some(AreaKind::Sentinel),
            _ => None,
        }
    }

    fn raw(self) -> u32 {
        match self {
            AreaKind::Free => 1,
            AreaKind::Occupied => 2,
            AreaKind::Sentinel => 3,
        }
    }
}

/// One arena slot. A zeroed slot is unused.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AreaNode {
    start: u32,
    size: u32,
    next: u32,
    kind: u32,
}

impl AreaNode {
    fn new(start: u32, size: u32, next: u32, kind: AreaKind) -> Self {
        AreaNode {
            start,
            size,
            next,
            kind: kind.raw(),
        }
    }

    fn kind(&self) -> Option<AreaKind> {
        AreaKind::from_raw(self.kind)
    }

    fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }
}

/// Public view of one area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AreaInfo {
    pub start: VirtAddr,
    pub size: usize,
    pub kind: AreaKind,
}

pub struct KernelHeap {
    arena_start: u64,
    arena_pages: usize,
    start: u64,
    end: u64,
    head: u32,
    sentinel: u32,
    cursor: u32,
    free_slot_hint: u32,
    backed_end: u64,
    page_usage: [u16; MAX_ARENA_PAGES],
    areas: usize,
}

fn align_up(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn align_down(value: u64) -> u64 {
    value / PAGE_SIZE * PAGE_SIZE
}

impl KernelHeap {
    /// Sets up a heap over `[start, start + size)` with one sentinel area.
    ///
    /// Only the first arena page gets backed.
    pub fn init<M: Mmu>(
        paging: &mut PageTableManager<M>,
        start: VirtAddr,
        size: u64,
    ) -> Result<Self, MemoryError> {
        assert!(start.is_aligned(PAGE_SIZE) && size % PAGE_SIZE == 0);
        let arena_size = align_up(size / 16).max(PAGE_SIZE);
        let arena_pages = (arena_size / PAGE_SIZE) as usize;
        assert!(arena_pages <= MAX_ARENA_PAGES, "heap of {:#x} bytes is too large", size);
        assert!(start.as_u64() + size <= u32::MAX as u64 + 1);

        let payload = start.as_u64() + arena_size;
        let mut heap = KernelHeap {
            arena_start: start.as_u64(),
            arena_pages,
            start: payload,
            end: start.as_u64() + size,
            head: NIL,
            sentinel: NIL,
            cursor: NIL,
            free_slot_hint: 0,
            backed_end: payload,
            page_usage: [0; MAX_ARENA_PAGES],
            areas: 0,
        };

        let slot = heap
            .take_slot(paging)
            .ok_or(MemoryError::HeapMetadataExhausted)?;
        let remaining = (heap.end - payload) as u32;
        heap.set_node(paging, slot, AreaNode::new(payload as u32, remaining, NIL, AreaKind::Sentinel));
        heap.head = slot;
        heap.sentinel = slot;
        heap.cursor = slot;
        Ok(heap)
    }

    fn node_addr(&self, slot: u32) -> VirtAddr {
        VirtAddr::new(self.arena_start + slot as u64 * NODE_SIZE as u64)
    }

    fn node<M: Mmu>(&self, paging: &PageTableManager<M>, slot: u32) -> AreaNode {
        let ptr = paging.kernel_ptr(self.node_addr(slot)).cast::<AreaNode>();
        // SAFETY: slots never straddle a page and live slots sit in backed arena pages
        unsafe { ptr::read_unaligned(ptr) }
    }

    fn set_node<M: Mmu>(&self, paging: &PageTableManager<M>, slot: u32, node: AreaNode) {
        let ptr = paging.kernel_ptr(self.node_addr(slot)).cast::<AreaNode>();
        unsafe { ptr::write_unaligned(ptr, node) };
    }

    fn page_flags<M: Mmu>(paging: &PageTableManager<M>) -> PageTableFlags {
        if paging.global_pages() {
            PageTableFlags::WRITABLE | PageTableFlags::GLOBAL
        } else {
            PageTableFlags::WRITABLE
        }
    }

    /// Claims an unused arena slot, backing its page if needed.
    fn take_slot<M: Mmu>(&mut self, paging: &mut PageTableManager<M>) -> Option<u32> {
        let capacity = (self.arena_pages * SLOTS_PER_PAGE) as u32;
        let mut slot = self.free_slot_hint;
        while slot < capacity {
            let page = slot as usize / SLOTS_PER_PAGE;
            match self.page_usage[page] as usize {
                0 => {
                    let addr = VirtAddr::new(self.arena_start + page as u64 * PAGE_SIZE);
                    let flags = Self::page_flags(paging);
                    paging.map(addr, None, 1, flags, false);
                    paging.fill_bytes(addr, 0, PAGE_SIZE as usize);
                    trace!("Heap arena grew by page {:#x}", addr.as_u64());
                    break;
                }
                SLOTS_PER_PAGE => slot = ((page + 1) * SLOTS_PER_PAGE) as u32,
                _ if self.node(paging, slot).kind == UNUSED => break,
                _ => slot += 1,
            }
        }
        if slot >= capacity {
            return None;
        }
        self.page_usage[slot as usize / SLOTS_PER_PAGE] += 1;
        self.free_slot_hint = slot + 1;
        self.areas += 1;
        Some(slot)
    }

    /// Returns a slot to the arena, unbacking its page once the page is empty.
    fn release_slot<M: Mmu>(&mut self, paging: &mut PageTableManager<M>, slot: u32) {
        self.set_node(paging, slot, AreaNode::default());
        let page = slot as usize / SLOTS_PER_PAGE;
        self.page_usage[page] -= 1;
        self.areas -= 1;
        if self.cursor == slot {
            self.cursor = self.head;
        }
        if self.page_usage[page] == 0 {
            let addr = VirtAddr::new(self.arena_start + page as u64 * PAGE_SIZE);
            paging.unmap(addr, 1, true);
            paging.flush_range(addr, 1);
            self.free_slot_hint = 0;
            trace!("Heap arena shrank by page {:#x}", addr.as_u64());
        } else if slot < self.free_slot_hint {
            self.free_slot_hint = slot;
        }
    }

    /// First free area of at least `size` bytes, searching on from the cursor.
    fn find_free<M: Mmu>(&self, paging: &PageTableManager<M>, size: u32) -> Option<u32> {
        let mut slot = self.cursor;
        loop {
            let node = self.node(paging, slot);
            if node.kind() == Some(AreaKind::Free) && node.size >= size {
                return Some(slot);
            }
            slot = if node.next == NIL { self.head } else { node.next };
            if slot == self.cursor {
                return None;
            }
        }
    }

    /// Whether the pages under `[start, start + len)` can be backed, with
    /// `spare` frames left over.
    fn can_back<M: Mmu>(paging: &PageTableManager<M>, start: u64, len: u64, spare: usize) -> bool {
        let first = align_down(start);
        let pages = ((align_up(start + len) - first) / PAGE_SIZE) as usize;
        paging.frames_needed_to_map(VirtAddr::new(first), pages) + spare
            <= paging.frames().free_count(PoolMask::DEFAULT)
    }

    fn back<M: Mmu>(&mut self, paging: &mut PageTableManager<M>, start: u64, len: u64) {
        let first = align_down(start);
        let last = align_up(start + len);
        let pages = ((last - first) / PAGE_SIZE) as usize;
        let flags = Self::page_flags(paging);
        paging.map(VirtAddr::new(first), None, pages, flags, false);
        self.backed_end = self.backed_end.max(last);
    }

    fn round(size: usize) -> Result<u32, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        size.checked_next_multiple_of(HEAP_GRANULE)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or(MemoryError::SizeOverflow)
    }

    /// Hands out `size` bytes, rounded up to the heap granule.
    pub fn allocate<M: Mmu>(
        &mut self,
        paging: &mut PageTableManager<M>,
        size: usize,
    ) -> Result<VirtAddr, MemoryError> {
        let size = Self::round(size)?;
        let slot = match self.find_free(paging, size) {
            Some(slot) => slot,
            None if self.node(paging, self.sentinel).size > size => self.sentinel,
            None => {
                warn!("Kernel heap out of memory for {} bytes", size);
                return Err(MemoryError::OutOfHeap {
                    requested: size as usize,
                });
            }
        };

        let node = self.node(paging, slot);
        let splits = node.size > size || slot == self.sentinel;
        // a split may need one more frame for a new arena page
        if !Self::can_back(paging, node.start as u64, size as u64, splits as usize) {
            warn!("No frames left to back {} heap bytes", size);
            return Err(MemoryError::OutOfHeap {
                requested: size as usize,
            });
        }

        if splits {
            let rest = self
                .take_slot(paging)
                .ok_or(MemoryError::HeapMetadataExhausted)?;
            let kind = if slot == self.sentinel {
                self.sentinel = rest;
                AreaKind::Sentinel
            } else {
                AreaKind::Free
            };
            let remainder = AreaNode::new(node.start + size, node.size - size, node.next, kind);
            self.set_node(paging, rest, remainder);
            self.set_node(paging, slot, AreaNode::new(node.start, size, rest, AreaKind::Occupied));
        } else {
            self.set_node(paging, slot, AreaNode::new(node.start, size, node.next, AreaKind::Occupied));
        }

        self.back(paging, node.start as u64, size as u64);
        self.cursor = slot;
        Ok(VirtAddr::new(node.start as u64))
    }

    /// Zeroed allocation of `count * size` bytes.
    pub fn calloc<M: Mmu>(
        &mut self,
        paging: &mut PageTableManager<M>,
        count: usize,
        size: usize,
    ) -> Result<VirtAddr, MemoryError> {
        let total = count.checked_mul(size).ok_or(MemoryError::SizeOverflow)?;
        let addr = self.allocate(paging, total)?;
        paging.fill_bytes(addr, 0, total);
        Ok(addr)
    }

    /// Slot of the area starting at `addr`, with its two predecessors.
    fn locate<M: Mmu>(&self, paging: &PageTableManager<M>, addr: VirtAddr) -> Option<[u32; 3]> {
        let target = addr.as_u64();
        let (mut before_prev, mut prev, mut slot) = (NIL, NIL, self.head);
        while slot != NIL {
            let node = self.node(paging, slot);
            if node.start as u64 == target {
                return Some([before_prev, prev, slot]);
            }
            if node.start as u64 > target {
                break;
            }
            (before_prev, prev, slot) = (prev, slot, node.next);
        }
        None
    }

    fn link<M: Mmu>(&mut self, paging: &PageTableManager<M>, prev: u32, next: u32) {
        if prev == NIL {
            self.head = next;
        } else {
            let mut node = self.node(paging, prev);
            node.next = next;
            self.set_node(paging, prev, node);
        }
    }

    /// Frees the area starting at `addr`, merging it with free neighbours.
    ///
    /// # Panics
    /// If no area starts at `addr` or the area is already free.
    pub fn free<M: Mmu>(&mut self, paging: &mut PageTableManager<M>, addr: VirtAddr) {
        let Some([before_prev, prev, slot]) = self.locate(paging, addr) else {
            panic!("free of {:#x}: no heap area starts there", addr.as_u64());
        };
        let mut current = slot;
        let mut node = self.node(paging, slot);
        assert_eq!(
            node.kind(),
            Some(AreaKind::Occupied),
            "double free of heap area {:#x}",
            addr.as_u64()
        );
        node.kind = AreaKind::Free.raw();
        self.set_node(paging, slot, node);

        if node.next != NIL {
            let next = node.next;
            let mut next_node = self.node(paging, next);
            match next_node.kind() {
                Some(AreaKind::Free) => {
                    node.size += next_node.size;
                    node.next = next_node.next;
                    self.set_node(paging, current, node);
                    self.release_slot(paging, next);
                }
                Some(AreaKind::Sentinel) => {
                    next_node.start = node.start;
                    next_node.size += node.size;
                    self.set_node(paging, next, next_node);
                    self.link(paging, prev, next);
                    self.release_slot(paging, current);
                    current = next;
                    node = next_node;
                }
                _ => {}
            }
        }

        if prev != NIL {
            let mut prev_node = self.node(paging, prev);
            if prev_node.kind() == Some(AreaKind::Free) {
                if current == self.sentinel {
                    node.start = prev_node.start;
                    node.size += prev_node.size;
                    self.set_node(paging, current, node);
                    self.link(paging, before_prev, current);
                    self.release_slot(paging, prev);
                } else {
                    prev_node.size += node.size;
                    prev_node.next = node.next;
                    self.set_node(paging, prev, prev_node);
                    self.release_slot(paging, current);
                    current = prev;
                    node = prev_node;
                }
            }
        }
        self.cursor = current;

        // pages entirely inside the merged free area are unused now
        let free_end = if current == self.sentinel {
            self.backed_end
        } else {
            node.end()
        };
        let first = align_up(node.start as u64);
        let last = align_down(free_end);
        if last > first {
            let pages = ((last - first) / PAGE_SIZE) as usize;
            paging.unmap(VirtAddr::new(first), pages, true);
            paging.flush_range(VirtAddr::new(first), pages);
            trace!("Heap returned {} pages at {:#x}", pages, first);
        }
        if current == self.sentinel {
            self.backed_end = self.backed_end.min(first.max(self.start));
        }
    }

    /// Resizes the area at `addr`, in place when possible.
    ///
    /// Shrinking never moves. Growing takes bytes from a free area right
    /// behind, or moves the contents to a new area.
    pub fn realloc<M: Mmu>(
        &mut self,
        paging: &mut PageTableManager<M>,
        addr: VirtAddr,
        new_size: usize,
    ) -> Result<VirtAddr, MemoryError> {
        let new_size = Self::round(new_size)?;
        let Some([_, _, slot]) = self.locate(paging, addr) else {
            panic!("realloc of {:#x}: no heap area starts there", addr.as_u64());
        };
        let mut node = self.node(paging, slot);
        assert_eq!(node.kind(), Some(AreaKind::Occupied), "realloc of free area {:#x}", addr.as_u64());
        if new_size <= node.size {
            return Ok(addr);
        }

        let grow = new_size - node.size;
        let next = node.next;
        let mut next_node = self.node(paging, next);
        let absorbable = match next_node.kind() {
            Some(AreaKind::Free) => next_node.size >= grow,
            Some(AreaKind::Sentinel) => next_node.size > grow,
            _ => false,
        };
        if absorbable && Self::can_back(paging, node.end(), grow as u64, 0) {
            if next_node.size == grow {
                node.next = next_node.next;
                self.release_slot(paging, next);
            } else {
                next_node.start += grow;
                next_node.size -= grow;
                self.set_node(paging, next, next_node);
            }
            let old_end = node.end();
            node.size = new_size;
            self.set_node(paging, slot, node);
            self.back(paging, old_end, grow as u64);
            self.cursor = slot;
            return Ok(addr);
        }

        let moved = self.allocate(paging, new_size as usize)?;
        paging.copy_bytes(moved, addr, node.size as usize);
        self.free(paging, addr);
        Ok(moved)
    }

    /// Size of the occupied area starting at `addr`.
    pub fn area_size<M: Mmu>(&self, paging: &PageTableManager<M>, addr: VirtAddr) -> Option<usize> {
        let [_, _, slot] = self.locate(paging, addr)?;
        let node = self.node(paging, slot);
        (node.kind() == Some(AreaKind::Occupied)).then_some(node.size as usize)
    }

    /// Areas in address order, sentinel last.
    pub fn areas<'a, M: Mmu>(
        &'a self,
        paging: &'a PageTableManager<M>,
    ) -> impl Iterator<Item = AreaInfo> + 'a {
        let mut slot = self.head;
        core::iter::from_fn(move || {
            if slot == NIL {
                return None;
            }
            let node = self.node(paging, slot);
            slot = node.next;
            let kind = node
                .kind()
                .unwrap_or_else(|| panic!("unused heap slot linked into the area list"));
            Some(AreaInfo {
                start: VirtAddr::new(node.start as u64),
                size: node.size as usize,
                kind,
            })
        })
    }

    /// Bytes still available, the unbacked tail included.
    pub fn free_bytes<M: Mmu>(&self, paging: &PageTableManager<M>) -> usize {
        self.areas(paging)
            .filter(|area| area.kind != AreaKind::Occupied)
            .map(|area| area.size)
            .sum()
    }

    pub fn used_bytes<M: Mmu>(&self, paging: &PageTableManager<M>) -> usize {
        self.areas(paging)
            .filter(|area| area.kind == AreaKind::Occupied)
            .map(|area| area.size)
            .sum()
    }

    /// Live area nodes, the sentinel included.
    pub fn area_count(&self) -> usize {
        self.areas
    }

    /// The payload range, without the node arena.
    pub fn payload(&self) -> core::ops::Range<VirtAddr> {
        VirtAddr::new(self.start)..VirtAddr::new(self.end)
    }
}
