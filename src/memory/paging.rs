//! Two-level page tables living in simulated physical frames.
//!
//! A directory is one frame of 1024 entries, each either empty or pointing
//! at a table frame of 1024 leaves. Entries are 32-bit: flags in the low
//! bits, frame number in bits 12..32. Every user directory shares the
//! kernel's first table, so the low kernel region is mapped everywhere.

use bit_field::BitField;
use bitflags::bitflags;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::Memory;
use crate::config::{ENTRIES_PER_TABLE, FIRST_FORK_PAGES, PAGE_SIZE, REGION_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

impl PteFlags {
    /// Flags of a freshly installed user page or table.
    pub const USER_RW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER);
}

/// One directory or table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysFrame, flags: PteFlags) -> Self {
        let mut raw = flags.bits();
        raw.set_bits(12..32, (frame.start_address().as_u64() >> 12) as u32);
        PageTableEntry(raw)
    }

    pub fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn frame(self) -> PhysFrame {
        let addr = (self.0.get_bits(12..32) as u64) << 12;
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    pub fn with_flags(self, flags: PteFlags) -> Self {
        let mut raw = self.0;
        raw.set_bits(0..12, flags.bits());
        PageTableEntry(raw)
    }

    pub fn insert(self, flags: PteFlags) -> Self {
        self.with_flags(self.flags() | flags)
    }

    pub fn remove(self, flags: PteFlags) -> Self {
        self.with_flags(self.flags() - flags)
    }
}

fn directory_index(addr: u32) -> usize {
    addr.get_bits(22..32) as usize
}

fn table_index(addr: u32) -> usize {
    addr.get_bits(12..22) as usize
}

fn slot(frame: PhysFrame, index: usize) -> PhysAddr {
    frame.start_address() + (index * 4) as u64
}

/// Handle to a page directory. Copyable; the owner releases the root frame
/// explicitly with [`AddressSpace::release_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysFrame,
}

impl AddressSpace {
    /// Directory at physical 0 with one table at 0x1000 identity-mapping
    /// `[0, low_mem)`. Both frames sit in the untracked kernel region.
    pub fn kernel(mem: &mut Memory, low_mem: u32) -> Self {
        let root = PhysFrame::containing_address(PhysAddr::new(0));
        let table = PhysFrame::containing_address(PhysAddr::new(PAGE_SIZE as u64));
        mem.phys.zero(root);
        mem.phys.zero(table);

        for page in 0..(low_mem as usize / PAGE_SIZE) {
            let frame = PhysFrame::containing_address(PhysAddr::new((page * PAGE_SIZE) as u64));
            let pte = PageTableEntry::new(frame, PteFlags::USER_RW);
            mem.phys.write_u32(slot(table, page), pte.raw());
        }
        let dir = PageTableEntry::new(table, PteFlags::USER_RW);
        mem.phys.write_u32(slot(root, 0), dir.raw());

        AddressSpace { root }
    }

    /// Fresh directory that shares the kernel region table of `kernel`.
    pub fn new_user(mem: &mut Memory, kernel: &AddressSpace) -> KernelResult<Self> {
        let root = mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        let shared = mem.phys.read_u32(slot(kernel.root, 0));
        mem.phys.write_u32(slot(root, 0), shared);
        Ok(AddressSpace { root })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    fn directory_entry(&self, mem: &Memory, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(mem.phys.read_u32(slot(self.root, index)))
    }

    fn set_directory_entry(&self, mem: &mut Memory, index: usize, entry: PageTableEntry) {
        mem.phys.write_u32(slot(self.root, index), entry.raw());
    }

    /// Leaf for `addr`, or `None` when no table covers it.
    pub fn entry(&self, mem: &Memory, addr: u32) -> Option<PageTableEntry> {
        let dir = self.directory_entry(mem, directory_index(addr));
        if !dir.is_present() {
            return None;
        }
        let raw = mem.phys.read_u32(slot(dir.frame(), table_index(addr)));
        Some(PageTableEntry::from_raw(raw))
    }

    /// Overwrite the leaf for `addr`. The covering table must exist.
    pub fn set_entry(&self, mem: &mut Memory, addr: u32, entry: PageTableEntry) {
        let dir = self.directory_entry(mem, directory_index(addr));
        if !dir.is_present() {
            panic!("no page table covers {:#x}", addr);
        }
        mem.phys.write_u32(slot(dir.frame(), table_index(addr)), entry.raw());
    }

    pub fn translate(&self, mem: &Memory, addr: u32) -> Option<PhysAddr> {
        let leaf = self.entry(mem, addr)?;
        if !leaf.is_present() {
            return None;
        }
        Some(leaf.frame().start_address() + (addr as u64 & (PAGE_SIZE as u64 - 1)))
    }

    /// Copy the mappings of `[from, from + size)` in `self` to `to` in
    /// `child`, write-protecting both copies. Tracked frames gain a
    /// reference; untracked kernel pages stay writable in the parent.
    ///
    /// Copying from linear 0 (the boot task) takes only the first 160
    /// pages of the kernel region.
    pub fn duplicate(
        &self,
        mem: &mut Memory,
        from: u32,
        child: &AddressSpace,
        to: u32,
        size: u32,
    ) -> KernelResult<()> {
        if from % REGION_SIZE != 0 || to % REGION_SIZE != 0 {
            panic!("duplicate called with wrong alignment");
        }
        let regions = (size as u64 + REGION_SIZE as u64 - 1) / REGION_SIZE as u64;
        let from_dir = directory_index(from);
        let to_dir = directory_index(to);

        for region in 0..regions as usize {
            let parent_dir = self.directory_entry(mem, from_dir + region);
            if !parent_dir.is_present() {
                continue;
            }
            if child.directory_entry(mem, to_dir + region).is_present() {
                panic!("duplicate: page table already exists at {:#x}", to as usize + region * REGION_SIZE as usize);
            }

            let table = mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
            child.set_directory_entry(mem, to_dir + region, PageTableEntry::new(table, PteFlags::USER_RW));

            let leaves = if from == 0 { FIRST_FORK_PAGES } else { ENTRIES_PER_TABLE };
            let parent_table = parent_dir.frame();
            for index in 0..leaves {
                let leaf = PageTableEntry::from_raw(mem.phys.read_u32(slot(parent_table, index)));
                if !leaf.is_present() {
                    continue;
                }
                let protected = leaf.remove(PteFlags::WRITABLE);
                mem.phys.write_u32(slot(table, index), protected.raw());
                if mem.is_tracked(leaf.frame()) {
                    mem.phys.write_u32(slot(parent_table, index), protected.raw());
                    mem.share_frame(leaf.frame());
                }
            }
        }
        Ok(())
    }

    /// Drop every mapping and table in `[base, base + size)`. Kernel pages
    /// below the tracked boundary are unmapped without being released.
    pub fn destroy(&self, mem: &mut Memory, base: u32, size: u32) {
        if base % REGION_SIZE != 0 {
            panic!("destroy called with wrong alignment");
        }
        if base == 0 {
            panic!("trying to free up kernel memory space");
        }
        let regions = (size as u64 + REGION_SIZE as u64 - 1) / REGION_SIZE as u64;
        let first = directory_index(base);

        for region in first..first + regions as usize {
            let dir = self.directory_entry(mem, region);
            if !dir.is_present() {
                continue;
            }
            let table = dir.frame();
            for index in 0..ENTRIES_PER_TABLE {
                let leaf = PageTableEntry::from_raw(mem.phys.read_u32(slot(table, index)));
                if leaf.is_present() && mem.is_tracked(leaf.frame()) {
                    mem.release_frame(leaf.frame());
                }
            }
            mem.release_frame(table);
            self.set_directory_entry(mem, region, PageTableEntry::empty());
        }
    }

    /// Map `frame` present, writable and user-accessible at `addr`,
    /// creating the covering table if needed.
    pub fn install_frame(&self, mem: &mut Memory, frame: PhysFrame, addr: u32) -> KernelResult<()> {
        if !mem.is_tracked(frame) {
            crate::log_warn!(
                "install_frame: page {:#x} at {:#x} is not allocatable memory",
                frame.start_address().as_u64(),
                addr
            );
        } else if mem.refcount(frame) != 1 {
            crate::log_warn!(
                "install_frame: mem_map disagrees with {:#x} at {:#x}",
                frame.start_address().as_u64(),
                addr
            );
        }

        self.ensure_table(mem, addr)?;
        self.set_entry(mem, addr, PageTableEntry::new(frame, PteFlags::USER_RW));
        Ok(())
    }

    /// Make sure a table covers `addr`, allocating one if needed.
    pub fn ensure_table(&self, mem: &mut Memory, addr: u32) -> KernelResult<()> {
        let index = directory_index(addr);
        if !self.directory_entry(mem, index).is_present() {
            let table = mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
            self.set_directory_entry(mem, index, PageTableEntry::new(table, PteFlags::USER_RW));
        }
        Ok(())
    }

    /// Free the directory frame itself. The kernel directory is never freed.
    pub fn release_root(self, mem: &mut Memory) {
        if mem.is_tracked(self.root) {
            mem.release_frame(self.root);
        }
    }
}
