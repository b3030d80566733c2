//! fork / exit / wait, plus the small process-identity calls around them.

use alloc::vec::Vec;
use bitflags::bitflags;

use super::signal::{SignalSet, SIGCHLD, SIGHUP};
use super::task::{ExitStatus, Process, ProcessId, ProcessState, Resume, Times};
use crate::arch::Platform;
use crate::config::{PAGE_SIZE, TASK_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::{InodeRef, ProgramHeader};
use crate::kernel::Kernel;
use crate::memory::AddressSpace;

/// Slot of the process that inherits orphans.
pub const INIT_SLOT: usize = 1;
pub const INIT_PID: ProcessId = ProcessId(1);

/// Largest text + data + bss image `exec` accepts.
pub const MAX_IMAGE: u32 = 0x300_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        /// Return at once instead of blocking.
        const NOHANG   = 1;
        /// Also report stopped children.
        const UNTRACED = 2;
    }
}

/// Which children a `wait` is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Pid(ProcessId),
    /// Any child in the caller's process group.
    SameGroup,
    Any,
    Group(ProcessId),
}

impl From<i32> for WaitTarget {
    fn from(pid: i32) -> Self {
        match pid {
            pid if pid > 0 => WaitTarget::Pid(ProcessId(pid)),
            0 => WaitTarget::SameGroup,
            -1 => WaitTarget::Any,
            pid => WaitTarget::Group(ProcessId(-pid)),
        }
    }
}

impl WaitTarget {
    fn matches(self, child: &Process, caller_pgrp: ProcessId) -> bool {
        match self {
            WaitTarget::Pid(pid) => child.pid == pid,
            WaitTarget::SameGroup => child.pgrp == caller_pgrp,
            WaitTarget::Any => true,
            WaitTarget::Group(pgrp) => child.pgrp == pgrp,
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Next unused pid, wrapping back to 1 on overflow.
    fn next_pid(&mut self) -> ProcessId {
        loop {
            self.sched.last_pid = self.sched.last_pid.checked_add(1).unwrap_or(1);
            let pid = ProcessId(self.sched.last_pid);
            if !self.tasks.pid_in_use(pid) {
                return pid;
            }
        }
    }

    /// Duplicate the current process. The child shares every page
    /// copy-on-write, every open file and directory, and resumes from the
    /// same saved context with 0 as the return value.
    pub fn fork(&mut self) -> KernelResult<ProcessId> {
        let pid = self.next_pid();
        let slot = self.tasks.free_slot().ok_or(KernelError::TryAgain)?;
        let base = slot as u32 * TASK_SIZE;

        let (parent_space, parent_base, size) = {
            let parent = self.current();
            (parent.space, parent.start_code, parent.limit)
        };
        let space = AddressSpace::new_user(&mut self.mem, &self.kernel_space)?;
        let copied = parent_space.duplicate(&mut self.mem, parent_base, &space, base, size);
        self.platform.invalidate_translations();
        if let Err(err) = copied {
            space.destroy(&mut self.mem, base, size);
            space.release_root(&mut self.mem);
            crate::log_warn!("fork: out of memory copying pid {}", self.current_pid());
            return Err(err);
        }

        let jiffies = self.sched.jiffies;
        let parent = self.current();
        let child = Process {
            pid,
            parent: Some(parent.pid),
            pgrp: parent.pgrp,
            session: parent.session,
            leader: false,
            name: parent.name.clone(),
            state: ProcessState::Ready,
            priority: parent.priority,
            counter: parent.priority,
            signal: SignalSet::empty(),
            blocked: parent.blocked,
            alarm: 0,
            exit_code: ExitStatus::default(),
            times: Times {
                start_time: jiffies,
                ..Times::default()
            },
            files: parent.files.clone(),
            pwd: parent.pwd.clone(),
            root: parent.root.clone(),
            executable: parent.executable.clone(),
            start_code: base,
            limit: parent.limit,
            end_code: parent.end_code,
            end_data: parent.end_data,
            brk: parent.brk,
            start_stack: parent.start_stack,
            space,
            context: parent.context.forked(space.root()),
            resume: None,
            interrupted: false,
        };
        let parent_pid = parent.pid;
        self.tasks.insert(slot, child);

        crate::log_info!("fork: pid {} -> pid {} (slot {})", parent_pid, pid, slot);
        Ok(pid)
    }

    /// Terminate the current process with `status`. Its memory and file
    /// references go at once; the descriptor stays as a zombie until the
    /// parent collects it. Switches away and never resumes the caller.
    pub fn exit(&mut self, status: ExitStatus) {
        let slot = self.sched.current;
        if slot == 0 {
            panic!("task[0] trying to exit");
        }
        let (pid, parent, space, base, limit) = {
            let p = self.current();
            (p.pid, p.parent, p.space, p.start_code, p.limit)
        };

        space.destroy(&mut self.mem, base, limit);
        space.release_root(&mut self.mem);
        self.platform.invalidate_translations();

        let mut zombie_orphans = false;
        for (_, p) in self.tasks.iter_mut() {
            if p.parent == Some(pid) {
                p.parent = Some(INIT_PID);
                zombie_orphans |= p.state == ProcessState::Zombie;
            }
        }
        if zombie_orphans {
            self.send_signal(INIT_SLOT, SIGCHLD);
        }

        let (leader, session) = {
            let p = self.current_mut();
            p.files.iter_mut().for_each(|f| *f = None);
            p.pwd = None;
            p.root = None;
            p.executable = None;
            p.state = ProcessState::Zombie;
            p.exit_code = status;
            p.alarm = 0;
            (p.leader, p.session)
        };
        if leader {
            self.kill_session(session);
        }
        crate::log_info!("exit: pid {} status {:#x}", pid, status.0);

        self.tell_parent(slot, parent);
        self.pick_next();
    }

    fn kill_session(&mut self, session: ProcessId) {
        let members: Vec<usize> = self
            .tasks
            .iter()
            .filter(|&(slot, p)| slot != 0 && p.session == session)
            .map(|(slot, _)| slot)
            .collect();
        for slot in members {
            self.send_signal(slot, SIGHUP);
        }
    }

    fn tell_parent(&mut self, slot: usize, parent: Option<ProcessId>) {
        let parent_slot = parent
            .filter(|pid| pid.0 != 0)
            .and_then(|pid| self.tasks.find_pid(pid));
        match parent_slot {
            Some(parent_slot) => self.send_signal(parent_slot, SIGCHLD),
            None => {
                if parent != Some(ProcessId(0)) {
                    crate::log_error!("exit: no parent found for slot {}", slot);
                }
                self.release(slot);
            }
        }
    }

    /// Free a zombie's slot.
    fn release(&mut self, slot: usize) -> Process {
        match self.tasks.remove(slot) {
            Some(p) => p,
            None => panic!("trying to release non-existent task {}", slot),
        }
    }

    /// Collect a child that exited (or, with `UNTRACED`, stopped).
    ///
    /// With live matching children and no `NOHANG`, the caller is put to
    /// sleep and `WouldBlock` is returned; the call is repeated once the
    /// caller runs again. `Interrupted` is returned by that repeat when a
    /// signal other than SIGCHLD woke it.
    pub fn wait(&mut self, target: WaitTarget, options: WaitOptions) -> KernelResult<(ProcessId, ExitStatus)> {
        let me = self.sched.current;
        let (my_pid, my_pgrp) = {
            let p = self.current_mut();
            if p.interrupted {
                p.interrupted = false;
                return Err(KernelError::Interrupted);
            }
            (p.pid, p.pgrp)
        };

        let mut waiting = false;
        let mut found = None;
        let children: Vec<(usize, &Process)> = self
            .tasks
            .iter()
            .filter(|&(slot, p)| slot != me && p.parent == Some(my_pid) && target.matches(p, my_pgrp))
            .collect();
        for &(slot, p) in children.iter().rev() {
            match p.state {
                ProcessState::Stopped if options.contains(WaitOptions::UNTRACED) => {
                    found = Some((slot, p.pid, false));
                    break;
                }
                ProcessState::Stopped => continue,
                ProcessState::Zombie => {
                    found = Some((slot, p.pid, true));
                    break;
                }
                _ => waiting = true,
            }
        }

        match found {
            Some((_, pid, false)) => return Ok((pid, ExitStatus::stopped())),
            Some((slot, _, true)) => {
                let child = self.release(slot);
                let p = self.current_mut();
                p.times.cutime += child.times.utime + child.times.cutime;
                p.times.cstime += child.times.stime + child.times.cstime;
                crate::log_info!("wait: pid {} reaped pid {}", my_pid, child.pid);
                return Ok((child.pid, child.exit_code));
            }
            None => {}
        }

        if !waiting {
            return Err(KernelError::NoChild);
        }
        if options.contains(WaitOptions::NOHANG) {
            return Err(KernelError::WouldBlock);
        }
        if me == 0 {
            panic!("task[0] trying to sleep");
        }
        let p = self.current_mut();
        p.state = ProcessState::Interruptible;
        p.resume = Some(Resume::Wait);
        self.pick_next();
        Err(KernelError::WouldBlock)
    }

    /// Replace the current image with a demand-paged one backed by `file`.
    /// Nothing is loaded here: every page arrives through the fault
    /// handler.
    pub fn exec(&mut self, file: InodeRef, header: ProgramHeader) -> KernelResult<()> {
        if self.sched.current == 0 {
            return Err(KernelError::PermissionDenied);
        }
        let image = header
            .text_size
            .checked_add(header.data_size)
            .and_then(|n| n.checked_add(header.bss_size));
        match image {
            Some(size) if size <= MAX_IMAGE => {}
            _ => return Err(KernelError::InvalidArgument),
        }

        let (space, base, limit) = {
            let p = self.current();
            (p.space, p.start_code, p.limit)
        };
        space.destroy(&mut self.mem, base, limit);
        self.platform.invalidate_translations();

        let p = self.current_mut();
        p.executable = Some(file);
        p.limit = TASK_SIZE;
        p.end_code = header.text_size;
        p.end_data = header.text_size + header.data_size;
        p.brk = p.end_data + header.bss_size;
        p.start_stack = TASK_SIZE - PAGE_SIZE as u32;
        p.signal = SignalSet::empty();
        p.alarm = 0;
        p.context = super::context::Context::new(space.root(), header.entry, TASK_SIZE - 4);
        crate::log_info!(
            "exec: pid {} text {:#x} data {:#x} bss {:#x}",
            p.pid,
            header.text_size,
            header.data_size,
            header.bss_size
        );
        Ok(())
    }

    /// Make the current process the leader of a new session and group.
    pub fn setsid(&mut self) -> KernelResult<ProcessId> {
        let p = self.current_mut();
        if p.leader {
            return Err(KernelError::PermissionDenied);
        }
        p.leader = true;
        p.session = p.pid;
        p.pgrp = p.pid;
        Ok(p.pgrp)
    }

    pub fn getpid(&self) -> ProcessId {
        self.current().pid
    }

    pub fn getppid(&self) -> ProcessId {
        self.current().parent.unwrap_or(ProcessId(0))
    }
}
