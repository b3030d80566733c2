//! Machine layout and kernel tuning constants.

use crate::error::{KernelError, KernelResult};

/// Size of a frame and of a page.
pub const PAGE_SIZE: usize = 4096;

/// Entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Linear range covered by one directory entry (4 MiB).
pub const REGION_SIZE: u32 = (PAGE_SIZE * ENTRIES_PER_TABLE) as u32;

/// Linear slot reserved for each task: task `n` lives at `n * TASK_SIZE`.
pub const TASK_SIZE: u32 = 64 * 1024 * 1024;

/// Hard upper bound on the task table.
pub const NR_TASKS: usize = 64;

/// Timer interrupts per second.
pub const HZ: u64 = 100;

/// Open-file slots per process.
pub const NR_OPEN: usize = 20;

/// File-system block size. A program page spans four blocks.
pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

/// Pages copied when the boot task forks: 640 KiB of kernel space.
pub const FIRST_FORK_PAGES: usize = 160;

/// Segment limit of the boot task.
pub const KERNEL_TASK_LIMIT: u32 = (FIRST_FORK_PAGES * PAGE_SIZE) as u32;

/// Quantum and priority given to the boot task.
pub const INIT_PRIORITY: i32 = 15;

/// Maximum number of pending kernel timers.
pub const TIME_REQUESTS: usize = 64;

/// Physical memory layout and table sizing for one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Frames below this address hold the kernel image and are never tracked.
    pub low_mem: u32,
    /// First address past the end of physical memory.
    pub memory_end: u32,
    /// Task table size, at most `NR_TASKS`.
    pub max_tasks: usize,
    /// Priority of the boot task, inherited by everything it forks.
    pub init_priority: i32,
    /// Physical hole `[start, end)` above `low_mem` that is never allocated.
    pub hole: Option<(u32, u32)>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            low_mem: 0x10_0000,
            memory_end: 0x100_0000,
            max_tasks: NR_TASKS,
            init_priority: INIT_PRIORITY,
            hole: None,
        }
    }
}

impl KernelConfig {
    /// A machine with exactly `frames` allocatable frames above `low_mem`.
    pub fn with_frames(frames: usize) -> Self {
        let base = KernelConfig::default();
        KernelConfig {
            memory_end: base.low_mem + (frames * PAGE_SIZE) as u32,
            ..base
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Number of frames the allocator tracks.
    pub fn tracked_frames(&self) -> usize {
        ((self.memory_end - self.low_mem) as usize) / PAGE_SIZE
    }

    pub fn with_hole(mut self, start: u32, end: u32) -> Self {
        self.hole = Some((start, end));
        self
    }

    pub fn validate(&self) -> KernelResult<()> {
        let page = PAGE_SIZE as u32;
        if self.low_mem % page != 0 || self.memory_end % page != 0 {
            return Err(KernelError::InvalidArgument);
        }
        // The kernel region is one page table; the boot task must fit in it.
        if self.low_mem < KERNEL_TASK_LIMIT || self.low_mem > REGION_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if self.memory_end <= self.low_mem {
            return Err(KernelError::InvalidArgument);
        }
        if self.max_tasks < 2 || self.max_tasks > NR_TASKS {
            return Err(KernelError::InvalidArgument);
        }
        if self.init_priority <= 0 {
            return Err(KernelError::InvalidArgument);
        }
        if let Some((start, end)) = self.hole {
            if start % page != 0 || start >= end || start < self.low_mem || end > self.memory_end {
                return Err(KernelError::InvalidArgument);
            }
        }
        Ok(())
    }
}
