use alloc::boxed::Box;

use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::fs::FileSystem;
use crate::memory::{AddressSpace, Memory, MemoryStats};
use crate::scheduler::timer::TimerList;
use crate::scheduler::{Process, ProcessId, Scheduler, TaskTable};

/// One machine: physical memory, the process table, the scheduler and the
/// collaborators it calls out to.
pub struct Kernel<P: Platform> {
    pub config: KernelConfig,
    pub mem: Memory,
    /// Directory of task 0; its first table is shared by every task.
    pub kernel_space: AddressSpace,
    pub tasks: TaskTable,
    pub sched: Scheduler,
    pub fs: Box<dyn FileSystem>,
    pub platform: P,
    pub(crate) timers: TimerList<P>,
}

impl<P: Platform> Kernel<P> {
    /// Build the kernel region and task 0, and start running it.
    pub fn boot(config: KernelConfig, fs: Box<dyn FileSystem>, platform: P) -> KernelResult<Self> {
        config.validate()?;

        let mut mem = Memory::new(&config);
        let kernel_space = AddressSpace::kernel(&mut mem, config.low_mem);
        let mut tasks = TaskTable::new(config.max_tasks);
        tasks.insert(0, Process::idle(kernel_space, config.init_priority));

        let mut kernel = Kernel {
            config,
            mem,
            kernel_space,
            tasks,
            sched: Scheduler::new(),
            fs,
            platform,
            timers: TimerList::new(),
        };
        let first = kernel.current().context;
        kernel.platform.restore(&first);

        crate::log_info!(
            "kernel: {} frames above {:#x}, {} task slots, fs {}",
            kernel.mem.stats().total,
            config.low_mem,
            config.max_tasks,
            kernel.fs.name()
        );
        Ok(kernel)
    }

    pub fn current_slot(&self) -> usize {
        self.sched.current
    }

    pub fn current(&self) -> &Process {
        self.tasks
            .by_slot(self.sched.current)
            .expect("current task slot is empty")
    }

    pub fn current_mut(&mut self) -> &mut Process {
        self.tasks
            .by_slot_mut(self.sched.current)
            .expect("current task slot is empty")
    }

    pub fn current_pid(&self) -> ProcessId {
        self.current().pid
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.tasks.find_pid(pid).and_then(|slot| self.tasks.by_slot(slot))
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        let slot = self.tasks.find_pid(pid)?;
        self.tasks.by_slot_mut(slot)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.mem.stats()
    }

    pub fn jiffies(&self) -> u64 {
        self.sched.jiffies
    }
}
