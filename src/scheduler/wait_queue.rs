use alloc::vec::Vec;

use super::table::TaskRef;

/// Handle to a wait-queue slot owned by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueueId(usize);

/// Every wait-queue slot. A slot holds only the most recent sleeper; the
/// ones before it are chained through the sleepers' own resume state.
#[derive(Debug, Default)]
pub struct WaitQueues {
    slots: Vec<Option<TaskRef>>,
    retired: Vec<usize>,
}

impl WaitQueues {
    pub fn new() -> Self {
        WaitQueues {
            slots: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Open a queue, reusing a destroyed slot when there is one.
    pub fn create(&mut self) -> WaitQueueId {
        if let Some(index) = self.retired.pop() {
            return WaitQueueId(index);
        }
        self.slots.push(None);
        WaitQueueId(self.slots.len() - 1)
    }

    /// Give the slot back. Nobody may still be sleeping on it, and `id`
    /// must not be used afterwards.
    pub fn destroy(&mut self, id: WaitQueueId) {
        if self.slots[id.0].is_some() {
            panic!("destroying wait queue {} with a sleeper", id.0);
        }
        if self.retired.contains(&id.0) {
            panic!("wait queue {} destroyed twice", id.0);
        }
        self.retired.push(id.0);
    }

    /// Queues currently open.
    pub fn len(&self) -> usize {
        self.slots.len() - self.retired.len()
    }

    pub fn head(&self, id: WaitQueueId) -> Option<TaskRef> {
        self.slots[id.0]
    }

    /// Put `task` at the head and return whoever was there.
    pub fn replace(&mut self, id: WaitQueueId, task: TaskRef) -> Option<TaskRef> {
        self.slots[id.0].replace(task)
    }

    pub fn take(&mut self, id: WaitQueueId) -> Option<TaskRef> {
        self.slots[id.0].take()
    }
}
