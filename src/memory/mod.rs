pub mod access;
pub mod fault;
pub mod frame_allocator;
pub mod paging;

use alloc::vec;
use alloc::vec::Vec;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::config::{KernelConfig, PAGE_SIZE};
use frame_allocator::FrameMap;

pub use paging::{AddressSpace, PageTableEntry, PteFlags};

// ─── Physical memory ─────────────────────────────────────────────

/// Backing store for every physical address below `memory_end`. Page
/// tables, program pages and the kernel region all live here.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    pub fn new(size: u32) -> Self {
        PhysicalMemory {
            bytes: vec![0; size as usize],
        }
    }

    fn range(&self, frame: PhysFrame) -> core::ops::Range<usize> {
        let start = frame.start_address().as_u64() as usize;
        if start + PAGE_SIZE > self.bytes.len() {
            panic!("frame {:#x} is outside physical memory", start);
        }
        start..start + PAGE_SIZE
    }

    pub fn page(&self, frame: PhysFrame) -> &[u8] {
        &self.bytes[self.range(frame)]
    }

    pub fn page_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        let range = self.range(frame);
        &mut self.bytes[range]
    }

    pub fn zero(&mut self, frame: PhysFrame) {
        self.page_mut(frame).fill(0);
    }

    /// Byte-for-byte copy of a whole frame.
    pub fn copy(&mut self, from: PhysFrame, to: PhysFrame) {
        let src = self.range(from);
        let dst = self.range(to).start;
        self.bytes.copy_within(src, dst);
    }

    pub fn read_u32(&self, addr: PhysAddr) -> u32 {
        let at = addr.as_u64() as usize;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn write_u32(&mut self, addr: PhysAddr, value: u32) {
        let at = addr.as_u64() as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

// ─── Frame allocator facade ──────────────────────────────────────

/// Snapshot of frame usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    /// Frames referenced by more than one address space.
    pub shared: usize,
}

/// Frame map plus the memory it describes.
pub struct Memory {
    pub frames: FrameMap,
    pub phys: PhysicalMemory,
}

impl Memory {
    pub fn new(config: &KernelConfig) -> Self {
        let mut frames = FrameMap::new(config.low_mem, config.memory_end);
        if let Some((start, end)) = config.hole {
            frames.reserve_range(start, end);
        }
        Memory {
            frames,
            phys: PhysicalMemory::new(config.memory_end),
        }
    }

    /// Hand out a zero-filled frame with reference count 1.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.frames.allocate()?;
        self.phys.zero(frame);
        Some(frame)
    }

    /// Drop one reference to `frame`, freeing it on the last one.
    pub fn release_frame(&mut self, frame: PhysFrame) {
        if frame.start_address().as_u64() < self.frames.low_mem() {
            panic!(
                "trying to free untracked page {:#x}",
                frame.start_address().as_u64()
            );
        }
        self.frames.release(frame);
    }

    pub fn share_frame(&mut self, frame: PhysFrame) {
        self.frames.share(frame);
    }

    pub fn is_tracked(&self, frame: PhysFrame) -> bool {
        self.frames.is_tracked(frame)
    }

    pub fn refcount(&self, frame: PhysFrame) -> u8 {
        self.frames.refcount(frame)
    }

    pub fn stats(&self) -> MemoryStats {
        let total = self.frames.total();
        let free = self.frames.free();
        MemoryStats {
            total,
            free,
            used: total - free,
            shared: self.frames.shared(),
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for Memory {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        Memory::allocate_frame(self)
    }
}

impl FrameDeallocator<Size4KiB> for Memory {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.release_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Memory {
        Memory::new(&KernelConfig::with_frames(4))
    }

    #[test]
    fn reallocated_frames_come_back_zeroed() {
        let mut mem = small();
        let frame = mem.allocate_frame().unwrap();
        mem.phys.page_mut(frame).fill(0xEE);
        mem.release_frame(frame);

        let again = mem.allocate_frame().unwrap();
        assert_eq!(again, frame);
        assert!(mem.phys.page(again).iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_duplicates_a_whole_frame() {
        let mut mem = small();
        let a = mem.allocate_frame().unwrap();
        let b = mem.allocate_frame().unwrap();
        mem.phys.page_mut(a)[..4].copy_from_slice(b"page");
        mem.phys.copy(a, b);
        assert_eq!(&mem.phys.page(b)[..4], b"page");
    }

    #[test]
    fn stats_track_sharing() {
        let mut mem = small();
        let a = mem.allocate_frame().unwrap();
        mem.share_frame(a);
        let stats = mem.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.used, 1);
        assert_eq!(stats.shared, 1);
    }

    #[test]
    fn trait_allocator_hands_out_frames() {
        let mut mem = small();
        let frame = FrameAllocator::<Size4KiB>::allocate_frame(&mut mem).unwrap();
        assert_eq!(mem.refcount(frame), 1);
        unsafe { mem.deallocate_frame(frame) };
        assert_eq!(mem.stats().free, 4);
    }

    #[test]
    #[should_panic(expected = "untracked page")]
    fn releasing_a_low_frame_is_fatal() {
        let mut mem = small();
        mem.release_frame(PhysFrame::containing_address(PhysAddr::new(0x1000)));
    }

    #[test]
    fn configured_hole_is_never_handed_out() {
        let config = KernelConfig::with_frames(4).with_hole(0x10_1000, 0x10_3000);
        let mut mem = Memory::new(&config);
        assert_eq!(mem.stats().free, 2);
        let mut got = [mem.allocate_frame().unwrap(), mem.allocate_frame().unwrap()];
        got.sort();
        assert_eq!(got[0].start_address().as_u64(), 0x10_0000);
        assert_eq!(got[1].start_address().as_u64(), 0x10_3000);
        assert_eq!(mem.allocate_frame(), None);
    }
}
