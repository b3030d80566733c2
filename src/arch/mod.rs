//! Hardware boundary: context switching, TLB invalidation and interrupt
//! masking.

use alloc::boxed::Box;
use x86_64::structures::paging::PhysFrame;

use crate::scheduler::context::Context;

/// What the core needs from the machine it runs on.
pub trait Platform {
    /// Save `from`, load `to` (registers and translation root).
    fn context_switch(&mut self, from: &Context, to: &Context);

    /// Load `to` without saving anything. Used for the first task.
    fn restore(&mut self, to: &Context);

    /// Drop cached translations after page tables changed.
    fn invalidate_translations(&mut self);
}

impl Platform for Box<dyn Platform + Send> {
    fn context_switch(&mut self, from: &Context, to: &Context) {
        (**self).context_switch(from, to)
    }

    fn restore(&mut self, to: &Context) {
        (**self).restore(to)
    }

    fn invalidate_translations(&mut self) {
        (**self).invalidate_translations()
    }
}

/// Simulated CPU: remembers the active page directory and counts events.
#[derive(Debug, Default)]
pub struct HostedPlatform {
    active_root: Option<PhysFrame>,
    active_eip: u32,
    switches: usize,
    flushes: usize,
}

impl HostedPlatform {
    pub fn new() -> Self {
        HostedPlatform::default()
    }

    pub fn active_root(&self) -> Option<PhysFrame> {
        self.active_root
    }

    pub fn active_eip(&self) -> u32 {
        self.active_eip
    }

    pub fn switches(&self) -> usize {
        self.switches
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Platform for HostedPlatform {
    fn context_switch(&mut self, _from: &Context, to: &Context) {
        self.switches += 1;
        self.restore(to);
    }

    fn restore(&mut self, to: &Context) {
        self.active_root = Some(to.root);
        self.active_eip = to.frame.eip;
    }

    fn invalidate_translations(&mut self) {
        self.flushes += 1;
    }
}

// ─── Critical sections ───────────────────────────────────────────

/// Run `f` with interrupts masked. Nests: the previous state is restored
/// on the way out.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    mask_interrupts(f)
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn mask_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
fn mask_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}
