//! Fixed-size process table.
//!
//! Slots are reused after a zombie is reaped, so long-lived references carry
//! the slot's generation and go stale instead of aliasing the next occupant.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::task::{Process, ProcessId};

/// Generation-checked reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub slot: usize,
    pub generation: u32,
}

impl TaskRef {
    pub fn new(slot: usize, generation: u32) -> Self {
        TaskRef { slot, generation }
    }
}

struct Slot {
    generation: u32,
    process: Option<Box<Process>>,
}

pub struct TaskTable {
    slots: Vec<Slot>,
}

impl TaskTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                process: None,
            });
        }
        TaskTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live processes, zombies included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.process.is_some()).count()
    }

    /// First empty slot above the idle task.
    pub fn free_slot(&self) -> Option<usize> {
        (1..self.slots.len()).find(|&i| self.slots[i].process.is_none())
    }

    pub fn insert(&mut self, slot: usize, process: Process) -> TaskRef {
        let entry = &mut self.slots[slot];
        if entry.process.is_some() {
            panic!("task slot {} is already in use", slot);
        }
        entry.process = Some(Box::new(process));
        TaskRef::new(slot, entry.generation)
    }

    /// Empty `slot`, invalidating every outstanding reference to it.
    pub fn remove(&mut self, slot: usize) -> Option<Process> {
        let entry = self.slots.get_mut(slot)?;
        let process = entry.process.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        Some(*process)
    }

    pub fn task_ref(&self, slot: usize) -> Option<TaskRef> {
        let entry = self.slots.get(slot)?;
        entry.process.as_ref()?;
        Some(TaskRef::new(slot, entry.generation))
    }

    pub fn get(&self, task: TaskRef) -> Option<&Process> {
        let entry = self.slots.get(task.slot)?;
        if entry.generation != task.generation {
            return None;
        }
        entry.process.as_deref()
    }

    pub fn get_mut(&mut self, task: TaskRef) -> Option<&mut Process> {
        let entry = self.slots.get_mut(task.slot)?;
        if entry.generation != task.generation {
            return None;
        }
        entry.process.as_deref_mut()
    }

    pub fn by_slot(&self, slot: usize) -> Option<&Process> {
        self.slots.get(slot)?.process.as_deref()
    }

    pub fn by_slot_mut(&mut self, slot: usize) -> Option<&mut Process> {
        self.slots.get_mut(slot)?.process.as_deref_mut()
    }

    pub fn find_pid(&self, pid: ProcessId) -> Option<usize> {
        self.iter().find(|(_, p)| p.pid == pid).map(|(slot, _)| slot)
    }

    pub fn pid_in_use(&self, pid: ProcessId) -> bool {
        self.find_pid(pid).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Process)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.process.as_deref().map(|p| (i, p)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Process)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.process.as_deref_mut().map(|p| (i, p)))
    }
}
