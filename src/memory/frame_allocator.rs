use alloc::vec;
use alloc::vec::Vec;
use x86_64::{structures::paging::PhysFrame, PhysAddr};

use crate::config::PAGE_SIZE;

/// Physical-frame reference map for everything between `low_mem` and the
/// end of memory. Count 0 is free, 1 exclusive, more than 1 shared
/// copy-on-write. Frames below `low_mem` are not tracked at all.
pub struct FrameMap {
    low_mem: u64,
    high_mem: u64,
    refcounts: Vec<u8>,
    reserved: Vec<bool>,
    free: usize,
}

impl FrameMap {
    pub fn new(low_mem: u32, memory_end: u32) -> Self {
        let frames = ((memory_end - low_mem) as usize) / PAGE_SIZE;
        FrameMap {
            low_mem: low_mem as u64,
            high_mem: memory_end as u64,
            refcounts: vec![0; frames],
            reserved: vec![false; frames],
            free: frames,
        }
    }

    /// First tracked physical address.
    pub fn low_mem(&self) -> u64 {
        self.low_mem
    }

    pub fn total(&self) -> usize {
        self.refcounts.len()
    }

    pub fn free(&self) -> usize {
        self.free
    }

    /// True when the allocator owns `frame` (above the low boundary, below
    /// the end of memory).
    pub fn is_tracked(&self, frame: PhysFrame) -> bool {
        let addr = frame.start_address().as_u64();
        addr >= self.low_mem && addr < self.high_mem
    }

    fn index(&self, frame: PhysFrame) -> usize {
        let addr = frame.start_address().as_u64();
        if addr < self.low_mem {
            panic!("frame {:#x} is below the tracked region", addr);
        }
        if addr >= self.high_mem {
            panic!("trying to free nonexistent page {:#x}", addr);
        }
        ((addr - self.low_mem) as usize) / PAGE_SIZE
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(self.low_mem + (index * PAGE_SIZE) as u64))
    }

    pub fn refcount(&self, frame: PhysFrame) -> u8 {
        self.refcounts[self.index(frame)]
    }

    /// Claim a free frame with count 1. Scans from the top of memory down.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        if self.free == 0 {
            return None;
        }
        let index = self.refcounts.iter().rposition(|&count| count == 0)?;
        self.refcounts[index] = 1;
        self.free -= 1;
        Some(self.frame_at(index))
    }

    /// Drop one reference. Returns true when the frame became free.
    pub fn release(&mut self, frame: PhysFrame) -> bool {
        let index = self.index(frame);
        if self.reserved[index] {
            panic!("trying to free reserved page {:#x}", frame.start_address().as_u64());
        }
        match self.refcounts[index] {
            0 => panic!("trying to free free page {:#x}", frame.start_address().as_u64()),
            1 => {
                self.refcounts[index] = 0;
                self.free += 1;
                true
            }
            _ => {
                self.refcounts[index] -= 1;
                false
            }
        }
    }

    /// Add a reference for a mapping duplicated into another address space.
    pub fn share(&mut self, frame: PhysFrame) {
        let index = self.index(frame);
        if self.reserved[index] {
            panic!("sharing reserved page {:#x}", frame.start_address().as_u64());
        }
        match self.refcounts[index] {
            0 => panic!("sharing free page {:#x}", frame.start_address().as_u64()),
            u8::MAX => panic!("page {:#x} reference count overflow", frame.start_address().as_u64()),
            _ => self.refcounts[index] += 1,
        }
    }

    /// Permanently withhold `[start, end)` from allocation (memory holes).
    pub fn reserve_range(&mut self, start: u32, end: u32) {
        let mut addr = (start as u64).max(self.low_mem) & !(PAGE_SIZE as u64 - 1);
        let end = (end as u64).min(self.high_mem);
        while addr < end {
            let index = ((addr - self.low_mem) as usize) / PAGE_SIZE;
            if self.refcounts[index] == 0 {
                self.free -= 1;
                self.refcounts[index] = 1;
            }
            self.reserved[index] = true;
            addr += PAGE_SIZE as u64;
        }
    }

    /// Frames mapped by more than one address space.
    pub fn shared(&self) -> usize {
        self.refcounts.iter().filter(|&&count| count > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn allocates_from_the_top_until_exhausted() {
        let mut map = FrameMap::new(0x10_0000, 0x10_3000);
        assert_eq!(map.allocate(), Some(frame(0x10_2000)));
        assert_eq!(map.allocate(), Some(frame(0x10_1000)));
        assert_eq!(map.allocate(), Some(frame(0x10_0000)));
        assert_eq!(map.allocate(), None);
        assert_eq!(map.free(), 0);
    }

    #[test]
    fn shared_frame_survives_until_last_release() {
        let mut map = FrameMap::new(0x10_0000, 0x10_2000);
        let f = map.allocate().unwrap();
        map.share(f);
        assert_eq!(map.refcount(f), 2);
        assert_eq!(map.shared(), 1);
        assert!(!map.release(f));
        assert!(map.release(f));
        assert_eq!(map.free(), 2);
    }

    #[test]
    fn reserved_range_is_never_handed_out() {
        let mut map = FrameMap::new(0x10_0000, 0x10_3000);
        map.reserve_range(0x10_1000, 0x10_3000);
        assert_eq!(map.free(), 1);
        assert_eq!(map.allocate(), Some(frame(0x10_0000)));
        assert_eq!(map.allocate(), None);
    }

    #[test]
    fn low_frames_are_untracked() {
        let map = FrameMap::new(0x10_0000, 0x10_2000);
        assert!(!map.is_tracked(frame(0x9_f000)));
        assert!(map.is_tracked(frame(0x10_1000)));
        assert!(!map.is_tracked(frame(0x10_2000)));
    }

    #[test]
    #[should_panic(expected = "reference count overflow")]
    fn refcount_saturation_is_fatal() {
        let mut map = FrameMap::new(0x10_0000, 0x10_1000);
        let f = map.allocate().unwrap();
        for _ in 0..255 {
            map.share(f);
        }
    }

    #[test]
    #[should_panic(expected = "trying to free free page")]
    fn double_free_is_fatal() {
        let mut map = FrameMap::new(0x10_0000, 0x10_2000);
        let f = map.allocate().unwrap();
        map.release(f);
        map.release(f);
    }

    #[test]
    #[should_panic(expected = "nonexistent page")]
    fn freeing_past_the_end_is_fatal() {
        let mut map = FrameMap::new(0x10_0000, 0x10_2000);
        map.release(frame(0x20_0000));
    }

    #[test]
    #[should_panic(expected = "reserved page")]
    fn freeing_a_reserved_frame_is_fatal() {
        let mut map = FrameMap::new(0x10_0000, 0x10_2000);
        map.reserve_range(0x10_0000, 0x10_1000);
        map.release(frame(0x10_0000));
    }
}
