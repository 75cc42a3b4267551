//! 32-bit page directory and page table entries.
//!
//! The low twelve flag bits of a legacy entry line up with the 64-bit layout,
//! so [`PageTableFlags`] describes both. Only the frame field differs: it is
//! the top twenty bits of a `u32`.

use core::fmt;

use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr,
};

/// Software bit marking a read-only mapping that is shared until written.
pub const COPY_ON_WRITE: PageTableFlags = PageTableFlags::BIT_9;

/// Software bit marking a mapping of memory the frame pools do not own, such
/// as device memory. Such frames are shared as is by clones and never freed.
pub const NO_FREE: PageTableFlags = PageTableFlags::BIT_10;

/// Flags a caller may ask `map` for. `PRESENT` is implied.
pub const MAPPING_FLAGS: PageTableFlags = PageTableFlags::WRITABLE
    .union(PageTableFlags::USER_ACCESSIBLE)
    .union(COPY_ON_WRITE)
    .union(NO_FREE)
    .union(PageTableFlags::GLOBAL);

const FRAME_MASK: u32 = 0xFFFF_F000;
const FLAG_MASK: u32 = 0x0000_0FFF;

/// One slot of a directory or table.
///
/// An entry is absent, or present with a frame; a present copy-on-write
/// entry is never writable, and a no-free entry is never copy-on-write. The constructors enforce this, so code holding
/// an `Entry` never has to re-check it.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const ABSENT: Entry = Entry(0);

    /// Directory entry pointing at a page table.
    ///
    /// Access control is left to the leaf entries, so user tables are marked
    /// user-accessible and writable at this level.
    pub fn table(frame: PhysFrame, user: bool) -> Self {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        Self::compose(frame, flags)
    }

    /// Leaf entry mapping a page to `frame`.
    pub fn page(frame: PhysFrame, flags: PageTableFlags) -> Self {
        let mut flags = flags | PageTableFlags::PRESENT;
        if flags.contains(NO_FREE) {
            flags.remove(COPY_ON_WRITE);
        }
        if flags.contains(COPY_ON_WRITE) {
            flags.remove(PageTableFlags::WRITABLE);
        }
        Self::compose(frame, flags)
    }

    fn compose(frame: PhysFrame, flags: PageTableFlags) -> Self {
        let address = frame.start_address().as_u64();
        assert!(
            address <= FRAME_MASK as u64,
            "frame {:#x} is beyond 32-bit physical memory",
            address
        );
        Entry(address as u32 | (flags.bits() as u32 & FLAG_MASK))
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Entry(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate((self.0 & FLAG_MASK) as u64)
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new((self.0 & FRAME_MASK) as u64))
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn is_cow(self) -> bool {
        self.flags().contains(COPY_ON_WRITE)
    }

    pub fn is_no_free(self) -> bool {
        self.flags().contains(NO_FREE)
    }

    /// The same mapping, shared read-only until written.
    pub fn make_cow(self) -> Self {
        debug_assert!(self.is_present());
        Self::page(self.frame(), self.flags() | COPY_ON_WRITE)
    }

    /// The same mapping, private and writable again.
    pub fn resolve_cow(self) -> Self {
        let flags = (self.flags() - COPY_ON_WRITE) | PageTableFlags::WRITABLE;
        Self::page(self.frame(), flags)
    }

    /// The same flags, pointing at another frame.
    pub fn with_frame(self, frame: PhysFrame) -> Self {
        Self::page(frame, self.flags())
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return write!(f, "Entry(absent)");
        }
        write!(
            f,
            "Entry({:#010x}, {:?})",
            self.frame().start_address().as_u64(),
            self.flags()
        )
    }
}
