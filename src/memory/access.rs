//! Software MMU: moves bytes between the kernel and the current task's
//! segment, walking its page tables and faulting pages in the way the
//! hardware would.

use x86_64::structures::paging::PhysFrame;

use super::fault::FaultKind;
use super::paging::PteFlags;
use crate::arch::Platform;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;

impl<P: Platform> Kernel<P> {
    /// Copy `buf.len()` bytes from segment offset `offset`.
    pub fn read_user(&mut self, offset: u32, buf: &mut [u8]) -> KernelResult<()> {
        self.check_segment(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let linear = self.current().linear(offset + done as u32);
            let in_page = linear as usize % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(buf.len() - done);
            let frame = self.touch(linear, false)?;
            buf[done..done + n].copy_from_slice(&self.mem.phys.page(frame)[in_page..in_page + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `data` to segment offset `offset`, splitting shared pages.
    pub fn write_user(&mut self, offset: u32, data: &[u8]) -> KernelResult<()> {
        self.check_segment(offset, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let linear = self.current().linear(offset + done as u32);
            let in_page = linear as usize % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(data.len() - done);
            let frame = self.touch(linear, true)?;
            self.mem.phys.page_mut(frame)[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub fn read_user_u32(&mut self, offset: u32) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.read_user(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_user_u32(&mut self, offset: u32, value: u32) -> KernelResult<()> {
        self.write_user(offset, &value.to_le_bytes())
    }

    fn check_segment(&self, offset: u32, len: usize) -> KernelResult<()> {
        let end = (offset as u64) + len as u64;
        if end > self.current().limit as u64 {
            return Err(KernelError::SegmentViolation);
        }
        Ok(())
    }

    /// Translate `linear` for an access, faulting until the leaf allows it,
    /// and mark the leaf accessed (and dirty on a write).
    fn touch(&mut self, linear: u32, write: bool) -> KernelResult<PhysFrame> {
        loop {
            let space = self.current().space;
            let leaf = space.entry(&self.mem, linear).filter(|leaf| leaf.is_present());
            let leaf = match leaf {
                None => {
                    self.page_fault(linear, FaultKind::NotPresent)?;
                    continue;
                }
                Some(leaf) if write && !leaf.is_writable() => {
                    self.page_fault(linear, FaultKind::WriteProtect)?;
                    continue;
                }
                Some(leaf) => leaf,
            };
            let mut flags = PteFlags::ACCESSED;
            if write {
                flags |= PteFlags::DIRTY;
            }
            space.set_entry(&mut self.mem, linear, leaf.insert(flags));
            return Ok(leaf.frame());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HostedPlatform;
    use crate::config::KernelConfig;
    use crate::fs::ramfs::RamFs;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    fn boot() -> Kernel<HostedPlatform> {
        let mut k = Kernel::boot(
            KernelConfig::with_frames(32),
            Box::new(RamFs::new(1)),
            HostedPlatform::new(),
        )
        .unwrap();
        k.fork().unwrap();
        k.pick_next();
        k
    }

    #[test]
    fn writes_cross_page_boundaries() {
        let mut k = boot();
        let data: Vec<u8> = (0..100u8).collect();
        k.write_user(PAGE_SIZE as u32 - 50, &data).unwrap();
        let mut back = vec![0u8; 100];
        k.read_user(PAGE_SIZE as u32 - 50, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn accesses_past_the_limit_are_refused() {
        let mut k = boot();
        let limit = k.current().limit;
        assert_eq!(k.write_user(limit - 2, &[0; 4]), Err(KernelError::SegmentViolation));
        let mut buf = [0u8; 1];
        assert_eq!(k.read_user(limit, &mut buf), Err(KernelError::SegmentViolation));
        assert!(k.read_user(limit - 1, &mut buf).is_ok());
    }

    #[test]
    fn leaves_record_access_and_writes() {
        let mut k = boot();
        k.read_user_u32(0x1000).unwrap();
        let p = k.current();
        let leaf = p.space.entry(&k.mem, p.linear(0x1000)).unwrap();
        assert!(leaf.flags().contains(PteFlags::ACCESSED));
        assert!(!leaf.flags().contains(PteFlags::DIRTY));

        k.write_user_u32(0x1000, 0xdead_beef).unwrap();
        assert_eq!(k.read_user_u32(0x1000), Ok(0xdead_beef));
        let p = k.current();
        let leaf = p.space.entry(&k.mem, p.linear(0x1000)).unwrap();
        assert!(leaf.flags().contains(PteFlags::DIRTY));
    }
}
