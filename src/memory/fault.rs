//! Page-fault resolution: demand loading, zero-fill, sharing pages of a
//! running executable, and copy-on-write splits.

use alloc::vec::Vec;
use x86_64::structures::idt::PageFaultErrorCode;

use super::paging::{AddressSpace, PageTableEntry, PteFlags};
use crate::arch::Platform;
use crate::config::{BLOCKS_PER_PAGE, BLOCK_SIZE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::{use_count, InodeRef, PageBlocks};
use crate::kernel::Kernel;
use crate::scheduler::signal::SIGSEGV;
use crate::scheduler::ExitStatus;

const PAGE_MASK: u32 = !(PAGE_SIZE as u32 - 1);

/// Why the MMU trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotPresent,
    /// Write to a present, read-only page.
    WriteProtect,
}

impl From<PageFaultErrorCode> for FaultKind {
    fn from(code: PageFaultErrorCode) -> Self {
        if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            FaultKind::WriteProtect
        } else {
            FaultKind::NotPresent
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Resolve a fault at linear address `addr` for the current task.
    /// A fault that cannot be resolved kills the task with SIGSEGV and
    /// returns `Terminated`; the kernel keeps running. So does a fault
    /// outside `[start_code, start_code + limit)`.
    pub fn page_fault(&mut self, addr: u32, kind: FaultKind) -> KernelResult<()> {
        let in_segment = {
            let p = self.current();
            addr.wrapping_sub(p.start_code) < p.limit
        };
        let result = match kind {
            _ if !in_segment => Err(KernelError::SegmentViolation),
            FaultKind::NotPresent => self.handle_missing(addr),
            FaultKind::WriteProtect => self.handle_write_protect(addr),
        };
        if let Err(err) = result {
            crate::log_warn!(
                "page fault: pid {} at {:#x} ({:?}): {}",
                self.current_pid(),
                addr,
                kind,
                err
            );
            self.exit(ExitStatus::signaled(SIGSEGV));
            return Err(KernelError::Terminated);
        }
        Ok(())
    }

    /// Map the page containing `addr`. Pages past the end of the data
    /// segment start out zeroed; program pages come from another process
    /// running the same file when possible, otherwise from disk.
    pub fn handle_missing(&mut self, addr: u32) -> KernelResult<()> {
        let page = addr & PAGE_MASK;
        let (space, offset, end_data, executable, shared) = {
            let p = self.current();
            let shared = p.executable.as_ref().map_or(false, |exe| use_count(exe) >= 2);
            (
                p.space,
                page.wrapping_sub(p.start_code),
                p.end_data,
                p.executable.clone(),
                shared,
            )
        };
        if space.translate(&self.mem, page).is_some() {
            return Ok(());
        }

        let executable = match executable {
            Some(exe) if offset < end_data => exe,
            _ => return self.zero_page(space, page),
        };
        if shared && self.share_page(&executable, offset)? {
            return Ok(());
        }

        let frame = self.mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        // block 0 holds the program header
        let first = 1 + offset / BLOCK_SIZE as u32;
        let mut blocks: PageBlocks = [None; BLOCKS_PER_PAGE];
        for (i, block) in blocks.iter_mut().enumerate() {
            *block = self.fs.block_for_offset(&executable, first + i as u32);
        }
        if let Err(err) = self
            .fs
            .read_blocks(&executable, &blocks, self.mem.phys.page_mut(frame))
        {
            self.mem.release_frame(frame);
            return Err(err.into());
        }

        let page_end = offset + PAGE_SIZE as u32;
        if page_end > end_data {
            let keep = PAGE_SIZE - (page_end - end_data) as usize;
            self.mem.phys.page_mut(frame)[keep..].fill(0);
        }
        if let Err(err) = space.install_frame(&mut self.mem, frame, page) {
            self.mem.release_frame(frame);
            return Err(err);
        }
        Ok(())
    }

    fn zero_page(&mut self, space: AddressSpace, page: u32) -> KernelResult<()> {
        let frame = self.mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        if let Err(err) = space.install_frame(&mut self.mem, frame, page) {
            self.mem.release_frame(frame);
            return Err(err);
        }
        Ok(())
    }

    /// Look for another process running `executable` that already has the
    /// page at `offset` loaded and clean, and map the same frame here.
    fn share_page(&mut self, executable: &InodeRef, offset: u32) -> KernelResult<bool> {
        let me = self.sched.current;
        let (space, base) = {
            let p = self.current();
            (p.space, p.start_code)
        };
        let donors: Vec<(AddressSpace, u32)> = self
            .tasks
            .iter()
            .filter(|&(slot, p)| {
                slot != 0
                    && slot != me
                    && p.executable
                        .as_ref()
                        .map_or(false, |exe| InodeRef::ptr_eq(exe, executable))
            })
            .map(|(_, p)| (p.space, p.start_code))
            .collect();

        for &(donor, donor_base) in donors.iter().rev() {
            if self.try_to_share(donor, donor_base + offset, space, base + offset)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_to_share(&mut self, from: AddressSpace, from_addr: u32, to: AddressSpace, to_addr: u32) -> KernelResult<bool> {
        let leaf = match from.entry(&self.mem, from_addr) {
            Some(leaf) if leaf.is_present() => leaf,
            _ => return Ok(false),
        };
        if leaf.flags().contains(PteFlags::DIRTY) || !self.mem.is_tracked(leaf.frame()) {
            return Ok(false);
        }
        if to.entry(&self.mem, to_addr).map_or(false, |e| e.is_present()) {
            panic!("try_to_share: to_page already exists");
        }
        to.ensure_table(&mut self.mem, to_addr)?;

        let protected = leaf.remove(PteFlags::WRITABLE);
        from.set_entry(&mut self.mem, from_addr, protected);
        to.set_entry(&mut self.mem, to_addr, protected);
        self.platform.invalidate_translations();
        self.mem.share_frame(leaf.frame());
        Ok(true)
    }

    /// Give the current task a private writable copy of the page at
    /// `addr`. A frame nobody else references is simply made writable.
    pub fn handle_write_protect(&mut self, addr: u32) -> KernelResult<()> {
        let page = addr & PAGE_MASK;
        let space = self.current().space;
        let leaf = match space.entry(&self.mem, page) {
            Some(leaf) if leaf.is_present() => leaf,
            _ => panic!("write-protect fault on unmapped page {:#x}", page),
        };
        if leaf.is_writable() {
            return Ok(());
        }

        let old = leaf.frame();
        let tracked = self.mem.is_tracked(old);
        if tracked {
            match self.mem.refcount(old) {
                0 => panic!("write-protect fault on free page {:#x}", old.start_address().as_u64()),
                1 => {
                    space.set_entry(&mut self.mem, page, leaf.insert(PteFlags::WRITABLE));
                    self.platform.invalidate_translations();
                    return Ok(());
                }
                _ => {}
            }
        }

        let new = self.mem.allocate_frame().ok_or(KernelError::OutOfMemory)?;
        self.mem.phys.copy(old, new);
        if tracked {
            self.mem.release_frame(old);
        }
        space.set_entry(&mut self.mem, page, PageTableEntry::new(new, PteFlags::USER_RW));
        self.platform.invalidate_translations();
        Ok(())
    }

    /// Split every copy-on-write page in `[offset, offset + len)` of the
    /// current segment before the kernel writes there on the task's behalf.
    /// Pages not yet present are left to fault on the write itself.
    pub fn verify_user_write(&mut self, offset: u32, len: u32) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        let (space, start, end) = {
            let p = self.current();
            (p.space, p.linear(offset) & PAGE_MASK, p.linear(offset.wrapping_add(len - 1)))
        };
        let mut page = start;
        while page <= end {
            if let Some(leaf) = space.entry(&self.mem, page) {
                if leaf.is_present() && !leaf.is_writable() {
                    self.page_fault(page, FaultKind::WriteProtect)?;
                }
            }
            match page.checked_add(PAGE_SIZE as u32) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HostedPlatform;
    use crate::config::KernelConfig;
    use crate::fs::ramfs::RamFs;
    use crate::scheduler::ProcessId;
    use alloc::boxed::Box;

    fn boot_with(fs: &RamFs, frames: usize) -> Kernel<HostedPlatform> {
        let mut k = Kernel::boot(
            KernelConfig::with_frames(frames),
            Box::new(fs.clone()),
            HostedPlatform::new(),
        )
        .unwrap();
        k.fork().unwrap();
        k.pick_next();
        k
    }

    fn leaf(k: &Kernel<HostedPlatform>, addr: u32) -> PageTableEntry {
        let p = k.current();
        p.space.entry(&k.mem, p.linear(addr)).unwrap()
    }

    #[test]
    fn error_code_maps_to_fault_kind() {
        assert_eq!(FaultKind::from(PageFaultErrorCode::CAUSED_BY_WRITE), FaultKind::NotPresent);
        assert_eq!(
            FaultKind::from(PageFaultErrorCode::PROTECTION_VIOLATION | PageFaultErrorCode::CAUSED_BY_WRITE),
            FaultKind::WriteProtect
        );
    }

    #[test]
    fn heap_pages_are_zero_filled_once() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[0x90; 100], &[], 0x1000, 0);
        let mut k = boot_with(&fs, 32);
        k.exec(inode, header).unwrap();
        let addr = k.current().linear(0x40_0000);
        let used = k.memory_stats().used;

        k.page_fault(addr, FaultKind::NotPresent).unwrap();
        let first = leaf(&k, 0x40_0000);
        assert!(first.is_present() && first.is_writable());
        assert!(k.mem.phys.page(first.frame()).iter().all(|&b| b == 0));
        // one page plus the table covering it
        assert_eq!(k.memory_stats().used, used + 2);

        k.page_fault(addr + 12, FaultKind::NotPresent).unwrap();
        assert_eq!(leaf(&k, 0x40_0000).frame(), first.frame());
        assert_eq!(k.memory_stats().used, used + 2);
    }

    #[test]
    fn faults_past_the_limit_kill_without_mapping_anything() {
        let fs = RamFs::new(1);
        let mut k = Kernel::boot(KernelConfig::with_frames(32), Box::new(fs), HostedPlatform::new()).unwrap();
        let used = k.memory_stats().used;
        k.fork().unwrap();
        k.pick_next();
        let limit = k.current().limit;
        let addr = k.current().linear(0x40_0000);
        assert!(0x40_0000 >= limit);

        assert_eq!(k.page_fault(addr, FaultKind::NotPresent), Err(KernelError::Terminated));
        assert!(k.process(ProcessId(1)).is_none());
        assert_eq!(k.memory_stats().used, used);
    }

    #[test]
    fn faults_below_the_segment_leave_the_kernel_table_alone() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[1; 64], &[], 0x1000, 0);
        let mut k = boot_with(&fs, 32);
        let faulty = k.fork().unwrap();
        let sibling = k.fork().unwrap();
        k.current_mut().counter = 0;
        k.pick_next();
        assert_eq!(k.current_pid(), faulty);
        k.exec(inode, header).unwrap();
        let used = k.memory_stats().used;

        // 0x20_0000 sits in the kernel region every directory shares
        assert_eq!(k.page_fault(0x20_0000, FaultKind::NotPresent), Err(KernelError::Terminated));
        assert_eq!(k.process(faulty).unwrap().state, crate::scheduler::ProcessState::Zombie);
        assert!(k.memory_stats().used < used);
        let s = k.process(sibling).unwrap();
        assert_eq!(s.space.translate(&k.mem, 0x20_0000), None);
        assert_eq!(k.tasks.by_slot(0).unwrap().space.translate(&k.mem, 0x20_0000), None);
    }

    #[test]
    fn program_pages_load_from_disk_with_a_zeroed_tail() {
        let fs = RamFs::new(1);
        let text: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8 + 1).collect();
        let (inode, header) = fs.add_program(&text, &[0xaa; 100], 0, 0);
        let mut k = boot_with(&fs, 32);
        k.exec(inode, header).unwrap();

        let second = k.current().linear(PAGE_SIZE as u32);
        k.page_fault(second, FaultKind::NotPresent).unwrap();
        let frame = leaf(&k, PAGE_SIZE as u32).frame();
        let bytes = k.mem.phys.page(frame);
        assert_eq!(&bytes[..6000 - PAGE_SIZE], &text[PAGE_SIZE..]);
        assert_eq!(&bytes[6000 - PAGE_SIZE..6100 - PAGE_SIZE], &[0xaa; 100][..]);
        assert!(bytes[6100 - PAGE_SIZE..].iter().all(|&b| b == 0));
        // blocks 5 and 6; the rest of the page is past the end of the file
        assert_eq!(fs.block_reads(), 2);
    }

    #[test]
    fn disk_errors_kill_the_faulting_task() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[1; 64], &[], 0, 0);
        let mut k = boot_with(&fs, 32);
        k.exec(inode, header).unwrap();
        let used = k.memory_stats().used;
        fs.set_fail_reads(true);

        let addr = k.current().linear(0);
        assert_eq!(k.page_fault(addr, FaultKind::NotPresent), Err(KernelError::Terminated));
        assert_eq!(k.current_pid(), ProcessId(0));
        assert!(k.process(ProcessId(1)).is_none());
        assert!(k.memory_stats().used < used);
    }

    #[test]
    fn running_the_same_file_shares_clean_pages() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[7; 3 * PAGE_SIZE], &[], 0, 0);
        let mut k = boot_with(&fs, 64);
        k.exec(inode.clone(), header).unwrap();
        k.page_fault(k.current().linear(0), FaultKind::NotPresent).unwrap();
        let first = leaf(&k, 0).frame();

        // a second process execs the same file and touches the same page
        let child = k.fork().unwrap();
        k.current_mut().counter = 0;
        k.pick_next();
        assert_eq!(k.current_pid(), child);
        k.exec(inode, header).unwrap();
        let reads = fs.block_reads();
        k.page_fault(k.current().linear(0), FaultKind::NotPresent).unwrap();

        assert_eq!(leaf(&k, 0).frame(), first);
        assert!(!leaf(&k, 0).is_writable());
        assert_eq!(k.mem.refcount(first), 2);
        assert_eq!(fs.block_reads(), reads);
    }

    #[test]
    fn dirty_pages_are_not_shared() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[7; PAGE_SIZE], &[], 0, 0);
        let mut k = boot_with(&fs, 64);
        k.exec(inode.clone(), header).unwrap();
        k.write_user(0, &[1, 2, 3]).unwrap();
        let first = leaf(&k, 0).frame();

        let child = k.fork().unwrap();
        k.current_mut().counter = 0;
        k.pick_next();
        assert_eq!(k.current_pid(), child);
        k.exec(inode, header).unwrap();
        k.page_fault(k.current().linear(0), FaultKind::NotPresent).unwrap();

        assert_ne!(leaf(&k, 0).frame(), first);
        assert_eq!(k.mem.phys.page(leaf(&k, 0).frame())[0], 7);
    }

    #[test]
    fn write_fault_on_an_exclusive_page_only_flips_the_bit() {
        let fs = RamFs::new(1);
        let mut k = boot_with(&fs, 32);
        k.write_user(0x2000, &[9; 4]).unwrap();
        let before = leaf(&k, 0x2000);
        let space = k.current().space;
        let linear = k.current().linear(0x2000);
        space.set_entry(&mut k.mem, linear, before.remove(PteFlags::WRITABLE));

        let flushes = k.platform.flushes();
        k.page_fault(linear, FaultKind::WriteProtect).unwrap();
        let after = leaf(&k, 0x2000);
        assert_eq!(after.frame(), before.frame());
        assert!(after.is_writable());
        assert_eq!(k.mem.phys.page(after.frame())[..4], [9; 4]);
        assert_eq!(k.platform.flushes(), flushes + 1);
    }

    #[test]
    fn write_fault_on_a_shared_page_splits_it() {
        let fs = RamFs::new(1);
        let mut k = boot_with(&fs, 64);
        k.write_user(0x3000, &[5; 8]).unwrap();
        let original = leaf(&k, 0x3000).frame();
        let child = k.fork().unwrap();
        assert_eq!(k.mem.refcount(original), 2);

        k.write_user(0x3000, &[6; 8]).unwrap();
        let copy = leaf(&k, 0x3000).frame();
        assert_ne!(copy, original);
        assert_eq!(k.mem.refcount(original), 1);
        assert_eq!(k.mem.phys.page(original)[..8], [5; 8]);
        assert_eq!(k.mem.phys.page(copy)[..8], [6; 8]);

        // the child still sees the old contents, read-only
        let c = k.process(child).unwrap();
        let child_leaf = c.space.entry(&k.mem, c.linear(0x3000)).unwrap();
        assert_eq!(child_leaf.frame(), original);
        assert!(!child_leaf.is_writable());
    }

    #[test]
    #[should_panic(expected = "write-protect fault on unmapped page")]
    fn write_fault_needs_a_mapping() {
        let fs = RamFs::new(1);
        let mut k = boot_with(&fs, 32);
        let addr = k.current().linear(0x50_0000);
        let _ = k.handle_write_protect(addr);
    }

    #[test]
    fn verify_splits_shared_pages_ahead_of_a_kernel_write() {
        let fs = RamFs::new(1);
        let mut k = boot_with(&fs, 64);
        k.write_user(0x4ff0, &[1; 32]).unwrap();
        k.fork().unwrap();
        assert!(!leaf(&k, 0x4000).is_writable());
        assert!(!leaf(&k, 0x5000).is_writable());

        k.verify_user_write(0x4ff0, 32).unwrap();
        assert!(leaf(&k, 0x4000).is_writable());
        assert!(leaf(&k, 0x5000).is_writable());
    }

    #[test]
    fn out_of_memory_terminates_instead_of_panicking() {
        let fs = RamFs::new(1);
        let (inode, header) = fs.add_program(&[1; 64], &[], 0x1000, 0);
        let mut k = boot_with(&fs, 3);
        k.exec(inode, header).unwrap();
        // the directory plus one heap page and its table use every frame
        k.page_fault(k.current().linear(0x40_0000), FaultKind::NotPresent).unwrap();
        assert_eq!(k.memory_stats().free, 0);

        let addr = k.current().linear(0x80_0000);
        assert_eq!(k.page_fault(addr, FaultKind::NotPresent), Err(KernelError::Terminated));
        assert_eq!(k.memory_stats().used, 0);
    }
}
