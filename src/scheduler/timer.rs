use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::Platform;
use crate::config::TIME_REQUESTS;
use crate::kernel::Kernel;

pub type TimerCallback<P> = Box<dyn FnOnce(&mut Kernel<P>) + Send>;

struct Timer<P: Platform> {
    expires: u64,
    callback: TimerCallback<P>,
}

/// Pending kernel timers, kept in expiry order.
pub struct TimerList<P: Platform> {
    timers: Vec<Timer<P>>,
}

impl<P: Platform> TimerList<P> {
    pub fn new() -> Self {
        TimerList { timers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn add(&mut self, expires: u64, callback: TimerCallback<P>) {
        if self.timers.len() >= TIME_REQUESTS {
            panic!("no more time requests free");
        }
        let at = self.timers.partition_point(|t| t.expires <= expires);
        self.timers.insert(at, Timer { expires, callback });
    }

    /// Remove and return every callback due at `now`, earliest first.
    pub fn expired(&mut self, now: u64) -> Vec<TimerCallback<P>> {
        let due = self.timers.partition_point(|t| t.expires <= now);
        self.timers.drain(..due).map(|t| t.callback).collect()
    }
}

impl<P: Platform> Default for TimerList<P> {
    fn default() -> Self {
        TimerList::new()
    }
}
