use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use super::context::Context;
use super::signal::SignalSet;
use super::table::TaskRef;
use super::wait_queue::WaitQueueId;
use crate::config::{KERNEL_TASK_LIMIT, NR_OPEN};
use crate::fs::{FileRef, InodeRef};
use crate::memory::AddressSpace;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub i32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    Interruptible,
    Uninterruptible,
    Zombie,
    Stopped,
}

impl ProcessState {
    pub fn is_runnable(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Ready)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, ProcessState::Interruptible | ProcessState::Uninterruptible)
    }
}

/// Status word reported by `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus(pub u32);

impl ExitStatus {
    /// Normal exit with `code`.
    pub fn exited(code: i32) -> Self {
        ExitStatus(((code as u32) & 0xff) << 8)
    }

    pub fn stopped() -> Self {
        ExitStatus(0x7f)
    }

    /// Terminated by signal `sig`.
    pub fn signaled(sig: u32) -> Self {
        ExitStatus(sig & 0x7f)
    }

    /// Exit code of a normal exit, `None` otherwise.
    pub fn code(self) -> Option<i32> {
        if self.0 & 0x7f == 0 {
            Some(((self.0 >> 8) & 0xff) as i32)
        } else {
            None
        }
    }

    pub fn signal(self) -> Option<u32> {
        match self.0 & 0x7f {
            0 | 0x7f => None,
            sig => Some(sig),
        }
    }

    pub fn is_stopped(self) -> bool {
        self.0 & 0xff == 0x7f
    }
}

/// CPU time in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Times {
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    pub start_time: u64,
}

/// Work a blocked task finishes the next time it is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Sleeping on `queue`; `previous` was the waiter chained before us.
    Sleep {
        queue: WaitQueueId,
        previous: Option<TaskRef>,
        interruptible: bool,
    },
    /// Blocked in `wait` until a child changes state.
    Wait,
    /// Blocked in `pause` until any signal.
    Pause,
}

/// A process control block.
pub struct Process {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub pgrp: ProcessId,
    pub session: ProcessId,
    pub leader: bool,
    pub name: String,
    pub state: ProcessState,

    pub priority: i32,
    pub counter: i32,

    pub signal: SignalSet,
    pub blocked: SignalSet,
    /// Jiffies at which SIGALRM fires, 0 when unset.
    pub alarm: u64,
    pub exit_code: ExitStatus,
    pub times: Times,

    /// Open files; a clone shares the file and its offset.
    pub files: Vec<Option<FileRef>>,
    pub pwd: Option<InodeRef>,
    pub root: Option<InodeRef>,
    pub executable: Option<InodeRef>,

    /// Linear base of the task's segment.
    pub start_code: u32,
    /// Segment limit in bytes.
    pub limit: u32,
    pub end_code: u32,
    pub end_data: u32,
    pub brk: u32,
    pub start_stack: u32,

    pub space: AddressSpace,
    pub context: Context,
    pub resume: Option<Resume>,
    /// A blocked `wait` was cut short by a signal.
    pub interrupted: bool,
}

impl Process {
    /// Task 0: runs in the kernel region, never sleeps, never exits.
    pub fn idle(space: AddressSpace, priority: i32) -> Self {
        Process {
            pid: ProcessId(0),
            parent: None,
            pgrp: ProcessId(0),
            session: ProcessId(0),
            leader: false,
            name: String::from("idle"),
            state: ProcessState::Running,
            priority,
            counter: priority,
            signal: SignalSet::empty(),
            blocked: SignalSet::empty(),
            alarm: 0,
            exit_code: ExitStatus::default(),
            times: Times::default(),
            files: vec![None; NR_OPEN],
            pwd: None,
            root: None,
            executable: None,
            start_code: 0,
            limit: KERNEL_TASK_LIMIT,
            end_code: KERNEL_TASK_LIMIT,
            end_data: KERNEL_TASK_LIMIT,
            brk: KERNEL_TASK_LIMIT,
            start_stack: KERNEL_TASK_LIMIT,
            space,
            context: Context::new(space.root(), 0, KERNEL_TASK_LIMIT),
            resume: None,
            interrupted: false,
        }
    }

    /// Pending signals that may be acted on now.
    pub fn deliverable(&self) -> SignalSet {
        self.signal & !(self.blocked & SignalSet::blockable())
    }

    /// Segment offset -> linear address.
    pub fn linear(&self, offset: u32) -> u32 {
        self.start_code.wrapping_add(offset)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("counter", &self.counter)
            .field("priority", &self.priority)
            .field("start_code", &format_args!("{:#x}", self.start_code))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encoding() {
        let status = ExitStatus::exited(7);
        assert_eq!(status.0, 0x700);
        assert_eq!(status.code(), Some(7));
        assert_eq!(status.signal(), None);

        let killed = ExitStatus::signaled(11);
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(11));

        assert!(ExitStatus::stopped().is_stopped());
        assert_eq!(ExitStatus::exited(0x1ff).code(), Some(0xff));
    }
}
