pub mod context;
pub mod lifecycle;
pub mod signal;
pub mod table;
pub mod task;
pub mod timer;
pub mod wait_queue;

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::Platform;
use crate::config::HZ;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use signal::{DefaultAction, SignalSet, NSIG, SIGALRM, SIGCHLD, SIGCONT, SIGKILL};

pub use context::{Context, TrapFrame};
pub use lifecycle::{WaitOptions, WaitTarget};
pub use table::{TaskRef, TaskTable};
pub use task::{ExitStatus, Process, ProcessId, ProcessState, Resume, Times};
pub use wait_queue::{WaitQueueId, WaitQueues};

/// Scheduler bookkeeping. The run set is the process table itself.
pub struct Scheduler {
    /// Slot of the running task.
    pub current: usize,
    /// Timer ticks since boot.
    pub jiffies: u64,
    pub queues: WaitQueues,
    pub(crate) last_pid: i32,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            current: 0,
            jiffies: 0,
            queues: WaitQueues::new(),
            last_pid: 0,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// One row of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub slot: usize,
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: ProcessState,
    pub counter: i32,
    pub priority: i32,
}

impl<P: Platform> Kernel<P> {
    // ─── Timer interrupt ─────────────────────────────────────────

    /// Periodic timer tick. `user_mode` tells whether the interrupted task
    /// was running user code; kernel code is never preempted.
    pub fn tick(&mut self, user_mode: bool) {
        self.sched.jiffies += 1;
        {
            let current = self.current_mut();
            if user_mode {
                current.times.utime += 1;
            } else {
                current.times.stime += 1;
            }
        }

        self.wake_signalled();
        self.run_timers();

        let current = self.current_mut();
        current.counter -= 1;
        if current.counter > 0 {
            return;
        }
        current.counter = 0;
        if !user_mode {
            return;
        }
        self.pick_next();
    }

    /// Run `callback` after `ticks` timer interrupts; immediately if 0.
    pub fn add_timer<F>(&mut self, ticks: u64, callback: F)
    where
        F: FnOnce(&mut Kernel<P>) + Send + 'static,
    {
        if ticks == 0 {
            callback(self);
            return;
        }
        let expires = self.sched.jiffies + ticks;
        self.timers.add(expires, alloc::boxed::Box::new(callback));
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn run_timers(&mut self) {
        for callback in self.timers.expired(self.sched.jiffies) {
            callback(self);
        }
    }

    /// Arm SIGALRM for the current task `seconds` from now (0 cancels).
    /// Returns the seconds that were left on the previous alarm.
    pub fn alarm(&mut self, seconds: u32) -> u32 {
        let now = self.sched.jiffies;
        let current = self.current_mut();
        let old = match current.alarm {
            0 => 0,
            at => (at.saturating_sub(now) / HZ) as u32,
        };
        current.alarm = if seconds > 0 { now + HZ * seconds as u64 } else { 0 };
        old
    }

    /// Fire expired alarms and make interruptible sleepers with a
    /// deliverable signal runnable again.
    fn wake_signalled(&mut self) {
        let now = self.sched.jiffies;
        for (slot, p) in self.tasks.iter_mut() {
            if slot == 0 {
                continue;
            }
            if p.alarm != 0 && p.alarm <= now {
                p.signal |= SignalSet::of(SIGALRM);
                p.alarm = 0;
            }
            if p.state == ProcessState::Interruptible && !p.deliverable().is_empty() {
                p.state = ProcessState::Ready;
            }
        }
    }

    // ─── Task selection ──────────────────────────────────────────

    /// Runnable task with the largest counter, scanning from slot 1 up.
    /// When every runnable task has used up its quantum, all counters decay
    /// to `counter / 2 + priority` and the scan repeats. Falls back to the
    /// idle task when nothing is runnable.
    fn select_next(&mut self) -> usize {
        loop {
            let mut best: Option<(usize, i32)> = None;
            for (slot, p) in self.tasks.iter() {
                if slot == 0 || !p.state.is_runnable() {
                    continue;
                }
                if best.map_or(true, |(_, counter)| p.counter > counter) {
                    best = Some((slot, p.counter));
                }
            }
            match best {
                None => return 0,
                Some((slot, counter)) if counter > 0 => return slot,
                Some(_) => {
                    for (_, p) in self.tasks.iter_mut() {
                        p.counter = (p.counter >> 1) + p.priority;
                    }
                }
            }
        }
    }

    /// Choose the next task and switch to it. A task resuming from a
    /// blocking call finishes that call first; if it has to block again the
    /// choice is repeated. Returns the slot left running.
    pub fn pick_next(&mut self) -> usize {
        self.wake_signalled();
        loop {
            let next = self.select_next();
            self.switch_to(next);
            let resume = match self.current_mut().resume.take() {
                Some(resume) => resume,
                None => return next,
            };
            if self.finish_resume(next, resume) {
                return next;
            }
        }
    }

    fn switch_to(&mut self, next: usize) {
        let prev = self.sched.current;
        let to = {
            let p = self
                .tasks
                .by_slot_mut(next)
                .expect("switching to an empty task slot");
            p.state = ProcessState::Running;
            p.context
        };
        if prev == next {
            return;
        }
        self.sched.current = next;

        match self.tasks.by_slot_mut(prev) {
            Some(p) => {
                if p.state == ProcessState::Running {
                    p.state = ProcessState::Ready;
                }
                let from = p.context;
                self.platform.context_switch(&from, &to);
            }
            // The previous task released itself on exit.
            None => self.platform.restore(&to),
        }
    }

    /// Finish a blocking call for the task that was just switched in.
    /// Returns false when it blocked again.
    fn finish_resume(&mut self, slot: usize, resume: Resume) -> bool {
        match resume {
            Resume::Sleep {
                previous,
                interruptible: false,
                ..
            } => {
                self.wake_task(previous);
                true
            }
            Resume::Sleep {
                queue,
                previous,
                interruptible: true,
            } => {
                let me = self.tasks.task_ref(slot);
                match self.sched.queues.head(queue) {
                    Some(head) if Some(head) != me && self.tasks.get(head).is_some() => {
                        // Someone queued up behind us: let them go first and
                        // go back to sleep.
                        self.wake_task(Some(head));
                        let p = self.current_mut();
                        p.state = ProcessState::Interruptible;
                        p.resume = Some(resume);
                        false
                    }
                    _ => {
                        self.sched.queues.take(queue);
                        self.wake_task(previous);
                        true
                    }
                }
            }
            Resume::Wait => {
                let p = self.current_mut();
                p.signal.remove(SignalSet::of(SIGCHLD));
                if !p.signal.is_empty() {
                    p.interrupted = true;
                }
                true
            }
            Resume::Pause => true,
        }
    }

    // ─── Blocking and waking ─────────────────────────────────────

    pub fn create_wait_queue(&mut self) -> WaitQueueId {
        self.sched.queues.create()
    }

    /// Retire a queue nobody sleeps on any more.
    pub fn destroy_wait_queue(&mut self, queue: WaitQueueId) {
        self.sched.queues.destroy(queue);
    }

    /// Block the current task on `queue` until a `wake`.
    pub fn sleep_on(&mut self, queue: WaitQueueId) {
        self.sleep(queue, false);
    }

    /// Block the current task on `queue` until a `wake` or a deliverable
    /// signal. The caller must check which one it was.
    pub fn sleep_interruptible(&mut self, queue: WaitQueueId) {
        self.sleep(queue, true);
    }

    fn sleep(&mut self, queue: WaitQueueId, interruptible: bool) {
        let slot = self.sched.current;
        if slot == 0 {
            panic!("task[0] trying to sleep");
        }
        let me = self
            .tasks
            .task_ref(slot)
            .expect("current task slot is empty");
        let previous = self.sched.queues.replace(queue, me);

        let p = self.current_mut();
        p.state = if interruptible {
            ProcessState::Interruptible
        } else {
            ProcessState::Uninterruptible
        };
        p.resume = Some(Resume::Sleep {
            queue,
            previous,
            interruptible,
        });
        self.pick_next();
    }

    /// Make the most recent sleeper on `queue` runnable and empty the slot.
    pub fn wake(&mut self, queue: WaitQueueId) {
        let head = self.sched.queues.take(queue);
        self.wake_task(head);
    }

    fn wake_task(&mut self, task: Option<TaskRef>) {
        if let Some(p) = task.and_then(|t| self.tasks.get_mut(t)) {
            if p.state.is_blocked() {
                p.state = ProcessState::Ready;
            }
        }
    }

    /// Lower the current task's priority by `increment` (raise it for a
    /// negative one). A change that would leave the priority at or below
    /// zero is ignored.
    pub fn nice(&mut self, increment: i32) {
        let p = self.current_mut();
        if let Some(priority) = p.priority.checked_sub(increment) {
            if priority > 0 {
                p.priority = priority;
            }
        }
    }

    /// Block until any signal arrives.
    pub fn pause(&mut self) {
        if self.sched.current != 0 {
            let p = self.current_mut();
            p.state = ProcessState::Interruptible;
            p.resume = Some(Resume::Pause);
        }
        self.pick_next();
    }

    // ─── Signals ─────────────────────────────────────────────────

    pub(crate) fn send_signal(&mut self, slot: usize, sig: u32) {
        if sig == 0 {
            return;
        }
        if let Some(p) = self.tasks.by_slot_mut(slot) {
            p.signal |= SignalSet::of(sig);
            if p.state == ProcessState::Stopped && (sig == SIGCONT || sig == SIGKILL) {
                p.state = ProcessState::Ready;
            }
        }
    }

    /// Send `sig` to a process (`pid > 0`), the caller's process group
    /// (`0`), every process (`-1`) or process group `-pid`.
    pub fn kill(&mut self, pid: i32, sig: u32) -> KernelResult<()> {
        if sig > NSIG {
            return Err(KernelError::InvalidArgument);
        }
        let my_pgrp = self.current().pgrp;
        let targets: Vec<usize> = self
            .tasks
            .iter()
            .filter(|&(slot, p)| {
                slot != 0
                    && match pid {
                        pid if pid > 0 => p.pid.0 == pid,
                        0 => p.pgrp == my_pgrp,
                        -1 => true,
                        pid => p.pgrp.0 == -pid,
                    }
            })
            .map(|(slot, _)| slot)
            .collect();
        if targets.is_empty() {
            return Err(KernelError::NoSuchProcess);
        }
        for slot in targets {
            self.send_signal(slot, sig);
        }
        Ok(())
    }

    /// Blocked mask of the current task.
    pub fn signal_mask(&self) -> SignalSet {
        self.current().blocked
    }

    /// Replace the blocked mask of the current task and return the old one.
    /// SIGKILL and SIGSTOP cannot be blocked.
    pub fn set_signal_mask(&mut self, mask: SignalSet) -> SignalSet {
        let p = self.current_mut();
        let old = p.blocked;
        p.blocked = mask & SignalSet::blockable();
        old
    }

    /// Stop the current task and let its parent know.
    pub fn stop_current(&mut self) {
        if self.sched.current == 0 {
            return;
        }
        let parent = {
            let p = self.current_mut();
            p.state = ProcessState::Stopped;
            p.exit_code = ExitStatus::stopped();
            p.parent
        };
        if let Some(slot) = parent.and_then(|pid| self.tasks.find_pid(pid)) {
            self.send_signal(slot, SIGCHLD);
        }
        self.pick_next();
    }

    /// Act on the current task's deliverable signals before it returns to
    /// user mode. No handlers exist, so every signal takes its default
    /// action.
    pub fn deliver_signals(&mut self) {
        if self.sched.current == 0 {
            self.current_mut().signal = SignalSet::empty();
            return;
        }
        while let Some(sig) = self.current().deliverable().first() {
            self.current_mut().signal.remove(SignalSet::of(sig));
            match signal::default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Stop => {
                    self.stop_current();
                    return;
                }
                DefaultAction::Terminate => {
                    self.exit(ExitStatus::signaled(sig));
                    return;
                }
            }
        }
    }

    // ─── Diagnostics ─────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .map(|(slot, p)| TaskInfo {
                slot,
                pid: p.pid,
                parent: p.parent,
                name: p.name.clone(),
                state: p.state,
                counter: p.counter,
                priority: p.priority,
            })
            .collect()
    }
}
