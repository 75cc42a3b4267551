//! A small simulated machine for the unit tests.
//!
//! 24 MiB of RAM: a 1 MiB low pool at 1 MiB and an 8 MiB default pool at
//! 16 MiB. Everything else is a hole, like real firmware maps tend to have.

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    constants::memory::{FRAME_SIZE, KERNEL_HEAP_SIZE, KERNEL_HEAP_START, SELF_SLOT},
    memory::{
        cow::CowRegistry,
        entry::Entry,
        frame_allocator::{GlobalFrameAllocator, Pool},
        memory_map::MemoryRegion,
        mmu::Mmu,
        paging::PageTableManager,
        soft_mmu::SoftMmu,
        stack_frame_allocator::{state_words, DefaultPoolStorage},
        Memory,
    },
};

const MIB: u64 = 1024 * 1024;
pub const RAM_SIZE: usize = 24 * MIB as usize;
pub const DEFAULT_FRAMES: usize = (8 * MIB) as usize / FRAME_SIZE;

const MEMORY_MAP: [MemoryRegion; 2] = [
    MemoryRegion::usable(MIB, MIB),
    MemoryRegion::usable(16 * MIB, 8 * MIB),
];

/// Fresh page tables with a bootstrapped, self-mapped directory loaded.
pub fn machine() -> PageTableManager<SoftMmu> {
    let ram: &'static mut [u8] = Box::leak(vec![0u8; RAM_SIZE].into_boxed_slice());
    let mmu = SoftMmu::new(ram);

    let storage = DefaultPoolStorage {
        stack: Box::leak(vec![0u32; DEFAULT_FRAMES].into_boxed_slice()),
        state: Box::leak(vec![0u64; state_words(RAM_SIZE / FRAME_SIZE)].into_boxed_slice()),
    };
    let mut frames = GlobalFrameAllocator::init(&MEMORY_MAP, PhysAddr::zero()..PhysAddr::zero(), storage);
    let counts = Box::leak(vec![0u16; RAM_SIZE / FRAME_SIZE].into_boxed_slice());
    let cow = CowRegistry::new(counts);

    // what a boot loader would hand over: an empty directory mapping itself
    let root = frames.allocate(Pool::Default);
    let directory = mmu.frame_ptr(root);
    unsafe {
        core::ptr::write_bytes(directory, 0, FRAME_SIZE);
        directory
            .cast::<u32>()
            .add(SELF_SLOT)
            .write(Entry::table(root, false).raw());
    }
    mmu.load_root(root);

    PageTableManager::new(frames, cow, mmu)
}

/// [`machine`] with kernel space reserved and the kernel heap set up.
pub fn memory() -> Memory<SoftMmu> {
    Memory::init(machine(), VirtAddr::new(KERNEL_HEAP_START), KERNEL_HEAP_SIZE)
        .unwrap_or_else(|err| panic!("test heap: {}", err))
}
