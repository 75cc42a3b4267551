//! Bootloader-neutral view of the physical memory map.
//!
//! The boot shim translates whatever its loader hands over (multiboot, e820,
//! a device tree) into [`MemoryRegion`]s once, before the frame allocator is
//! built.

use core::ops::Range;

use x86_64::{structures::paging::PhysFrame, PhysAddr};

use crate::constants::memory::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn usable(base: u64, length: u64) -> Self {
        MemoryRegion {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }
}

/// Whole frames inside usable regions, minus the kernel image and frame 0.
///
/// Partial frames at region edges are dropped.
pub fn usable_frames(
    memory_map: &[MemoryRegion],
    kernel_image: Range<PhysAddr>,
) -> impl Iterator<Item = PhysFrame> + '_ {
    let kernel_start = kernel_image.start.align_down(PAGE_SIZE).as_u64();
    let kernel_end = kernel_image.end.align_up(PAGE_SIZE).as_u64();
    memory_map
        .iter()
        .filter(|r| r.kind == RegionKind::Usable)
        .flat_map(|r| {
            let start = r.base.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let end = (r.base + r.length) / PAGE_SIZE * PAGE_SIZE;
            (start..end.max(start)).step_by(PAGE_SIZE as usize)
        })
        .filter(move |&addr| addr != 0 && (addr < kernel_start || addr >= kernel_end))
        .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_frames_skip_kernel_and_partial_frames() {
        let map = [
            MemoryRegion::usable(0, 0x3000),
            MemoryRegion {
                base: 0x3000,
                length: 0x1000,
                kind: RegionKind::Reserved,
            },
            MemoryRegion::usable(0x10_0800, 0x4000),
        ];
        let kernel = PhysAddr::new(0x10_2000)..PhysAddr::new(0x10_2800);
        let frames: [u64; 4] = [0x1000, 0x2000, 0x10_1000, 0x10_3000];

        let found = usable_frames(&map, kernel).map(|f| f.start_address().as_u64());
        assert!(found.eq(frames.iter().copied()));
    }
}
