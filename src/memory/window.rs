//! Scoped access to the page tables of an address space.
//!
//! The last directory slot of every address space points at the directory
//! itself, so the active tables appear as ordinary memory starting at
//! `ACTIVE_TABLES_START`. A foreign address space is reached the same way by
//! installing its directory in the slot before that, which makes its tables
//! appear at `FOREIGN_TABLES_START`. A [`Window`] owns that slot while it
//! lives and clears it again when dropped.

use core::ptr;

use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::{
    constants::memory::{
        ACTIVE_TABLES_START, ENTRY_COUNT, FOREIGN_SLOT, FOREIGN_TABLES_START, PAGE_SIZE,
        SELF_SLOT,
    },
    memory::{entry::Entry, mmu::Mmu},
};

/// Directory slot translating `addr`.
pub fn directory_index(addr: VirtAddr) -> usize {
    (addr.as_u64() >> 22) as usize & (ENTRY_COUNT - 1)
}

/// Table slot translating `addr`.
pub fn table_index(addr: VirtAddr) -> usize {
    (addr.as_u64() >> 12) as usize & (ENTRY_COUNT - 1)
}

pub struct Window<'a, M: Mmu> {
    mmu: &'a M,
    root: PhysFrame,
    active_root: PhysFrame,
    base: u64,
}

impl<'a, M: Mmu> Window<'a, M> {
    /// The tables of the active address space.
    pub(crate) fn active(mmu: &'a M, active_root: PhysFrame) -> Self {
        Window {
            mmu,
            root: active_root,
            active_root,
            base: ACTIVE_TABLES_START,
        }
    }

    /// The tables of the address space rooted at `root`, which may be the
    /// active one.
    ///
    /// # Panics
    /// If another foreign window is already open.
    pub(crate) fn open(mmu: &'a M, active_root: PhysFrame, root: PhysFrame) -> Self {
        if root == active_root {
            return Self::active(mmu, active_root);
        }
        let active = Self::active(mmu, active_root);
        assert!(
            !active.directory_entry(FOREIGN_SLOT).is_present(),
            "foreign page-table window already in use"
        );
        active.set_directory_entry(FOREIGN_SLOT, Entry::table(root, false));
        Window {
            mmu,
            root,
            active_root,
            base: FOREIGN_TABLES_START,
        }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn is_foreign(&self) -> bool {
        self.root != self.active_root
    }

    fn table_addr(&self, slot: usize) -> VirtAddr {
        VirtAddr::new(self.base + slot as u64 * PAGE_SIZE)
    }

    fn directory(&self) -> *mut u32 {
        self.mmu
            .virt_ptr(self.table_addr(SELF_SLOT), self.root)
            .cast::<u32>()
    }

    fn table(&self, slot: usize) -> Option<*mut u32> {
        let entry = self.directory_entry(slot);
        entry.is_present().then(|| {
            self.mmu
                .virt_ptr(self.table_addr(slot), entry.frame())
                .cast::<u32>()
        })
    }

    pub fn directory_entry(&self, slot: usize) -> Entry {
        assert!(slot < ENTRY_COUNT);
        // SAFETY: the directory page is mapped for as long as the window lives
        Entry::from_raw(unsafe { ptr::read_volatile(self.directory().add(slot)) })
    }

    pub fn set_directory_entry(&self, slot: usize, entry: Entry) {
        assert!(slot < ENTRY_COUNT);
        unsafe { ptr::write_volatile(self.directory().add(slot), entry.raw()) };
    }

    /// Leaf entry for `addr`; absent when its table is.
    pub fn entry(&self, addr: VirtAddr) -> Entry {
        match self.table(directory_index(addr)) {
            // SAFETY: a present directory entry maps its table into the window
            Some(table) => {
                Entry::from_raw(unsafe { ptr::read_volatile(table.add(table_index(addr))) })
            }
            None => Entry::ABSENT,
        }
    }

    /// # Panics
    /// If `addr` has no page table.
    pub fn set_entry(&self, addr: VirtAddr, entry: Entry) {
        let table = self
            .table(directory_index(addr))
            .unwrap_or_else(|| panic!("no page table for {:#x}", addr.as_u64()));
        unsafe { ptr::write_volatile(table.add(table_index(addr)), entry.raw()) };
    }

    /// Hooks a zeroed table in at `slot`.
    pub fn install_table(&self, slot: usize, frame: PhysFrame, user: bool) {
        self.set_directory_entry(slot, Entry::table(frame, user));
        // the window page may still translate to a previous table
        self.mmu.flush(self.table_addr(slot));
        if let Some(table) = self.table(slot) {
            unsafe { ptr::write_bytes(table, 0, ENTRY_COUNT) };
        }
    }

    /// Unhooks the table at `slot` and hands back its frame.
    pub fn remove_table(&self, slot: usize) -> Option<PhysFrame> {
        let entry = self.directory_entry(slot);
        if !entry.is_present() {
            return None;
        }
        self.set_directory_entry(slot, Entry::ABSENT);
        self.mmu.flush(self.table_addr(slot));
        Some(entry.frame())
    }

    /// Present leaf entries of the table at `slot`, with their addresses.
    pub fn present_entries(&self, slot: usize) -> impl Iterator<Item = (VirtAddr, Entry)> + '_ {
        let table = self.table(slot);
        (0..ENTRY_COUNT).filter_map(move |index| {
            let table = table?;
            let entry = Entry::from_raw(unsafe { ptr::read_volatile(table.add(index)) });
            let addr = VirtAddr::new(((slot << 22) | (index << 12)) as u64);
            entry.is_present().then_some((addr, entry))
        })
    }
}

impl<M: Mmu> Drop for Window<'_, M> {
    fn drop(&mut self) {
        if self.is_foreign() {
            Window::active(self.mmu, self.active_root).set_directory_entry(FOREIGN_SLOT, Entry::ABSENT);
            self.mmu.flush_all();
        }
    }
}
