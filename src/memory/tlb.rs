//! Legacy (32-bit, non-PAE) x86 paging hardware.

use core::arch::asm;

use lazy_static::lazy_static;
use raw_cpuid::CpuId;
use x86_64::{structures::paging::PhysFrame, PhysAddr, VirtAddr};

use crate::memory::mmu::Mmu;

const CR4_PGE: u32 = 1 << 7;

lazy_static! {
    static ref GLOBAL_PAGES: bool = CpuId::new()
        .get_feature_info()
        .is_some_and(|info| info.has_pge());
}

pub struct LegacyMmu {
    _private: (),
}

impl LegacyMmu {
    /// Takes over the paging hardware and turns on global pages when the CPU
    /// has them.
    ///
    /// # Safety
    /// Paging must be enabled with a directory whose last slot maps the
    /// directory itself, and only one `LegacyMmu` may exist.
    pub unsafe fn new() -> Self {
        if *GLOBAL_PAGES {
            write_cr4(read_cr4() | CR4_PGE);
        }
        LegacyMmu { _private: () }
    }
}

fn read_cr3() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

unsafe fn write_cr3(value: u32) {
    asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
}

fn read_cr4() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

unsafe fn write_cr4(value: u32) {
    asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags));
}

impl Mmu for LegacyMmu {
    fn active_root(&self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((read_cr3() & 0xFFFF_F000) as u64))
    }

    fn load_root(&self, root: PhysFrame) {
        unsafe { write_cr3(root.start_address().as_u64() as u32) };
    }

    fn flush(&self, addr: VirtAddr) {
        let vaddr = addr.as_u64() as u32;
        unsafe {
            asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
    }

    fn flush_all(&self) {
        // a root reload keeps global entries; toggling PGE drops them too
        unsafe {
            if *GLOBAL_PAGES {
                let cr4 = read_cr4();
                write_cr4(cr4 & !CR4_PGE);
                write_cr4(cr4);
            } else {
                write_cr3(read_cr3());
            }
        }
    }

    fn global_pages(&self) -> bool {
        *GLOBAL_PAGES
    }

    fn virt_ptr(&self, addr: VirtAddr, _frame: PhysFrame) -> *mut u8 {
        addr.as_u64() as usize as *mut u8
    }
}
