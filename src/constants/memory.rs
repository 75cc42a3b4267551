//! Address-space layout and sizing of the memory subsystem.
//!
//! The layout is a classic 32-bit higher-half split: user space below
//! `KERNEL_AREA_START`, the kernel above it, and the top three directory
//! slots reserved for per-address-space tables, the foreign window and the
//! self-reference.

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries in one page directory or page table.
pub const ENTRY_COUNT: usize = 1024;
/// Bytes of virtual space covered by one page table.
pub const TABLE_COVERAGE: u64 = PAGE_SIZE * ENTRY_COUNT as u64;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Frames below this physical address belong to the low (DMA) pool.
pub const LOW_POOL_LIMIT: u64 = 16 * 1024 * 1024;
pub const LOW_POOL_FRAMES: usize = (LOW_POOL_LIMIT / PAGE_SIZE) as usize;

/// One past the highest virtual address.
pub const ADDRESS_SPACE_END: u64 = 1 << 32;

pub const USER_TEXT_START: u64 = 0;
pub const KERNEL_AREA_START: u64 = 0xC000_0000;
pub const USER_STACK_TOP: u64 = KERNEL_AREA_START;

pub const KERNEL_HEAP_START: u64 = 0xC080_0000;
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024;
/// Every heap area is a multiple of this many bytes.
pub const HEAP_GRANULE: usize = 8;

pub const TEMP_MAP_AREA: u64 = KERNEL_HEAP_START + KERNEL_HEAP_SIZE;
pub const TEMP_MAP_AREA_SIZE: u64 = 16 * 1024 * 1024;

/// First directory slot whose table is private to each address space.
pub const PRIVATE_SLOT: usize = 1021;
pub const FOREIGN_SLOT: usize = 1022;
pub const SELF_SLOT: usize = 1023;

/// Kernel tables shared by every address space cover `[KERNEL_AREA_START, KERNEL_SHARED_END)`.
pub const KERNEL_SHARED_END: u64 = PRIVATE_SLOT as u64 * TABLE_COVERAGE;

pub const FOREIGN_TABLES_START: u64 = FOREIGN_SLOT as u64 * TABLE_COVERAGE;
pub const ACTIVE_TABLES_START: u64 = SELF_SLOT as u64 * TABLE_COVERAGE;

pub const TEMP_MAP_PAGE: u64 = FOREIGN_TABLES_START - PAGE_SIZE;
pub const KERNEL_STACK: u64 = TEMP_MAP_PAGE - PAGE_SIZE;
