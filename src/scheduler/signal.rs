use bitflags::bitflags;

pub const NSIG: u32 = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;

bitflags! {
    /// Pending or blocked signals; signal `n` is bit `n - 1`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalSet: u32 {
        const _ = !0;
    }
}

impl SignalSet {
    pub fn of(sig: u32) -> SignalSet {
        assert!(sig >= 1 && sig <= NSIG, "bad signal number {}", sig);
        SignalSet::from_bits_retain(1 << (sig - 1))
    }

    /// Everything except SIGKILL and SIGSTOP.
    pub fn blockable() -> SignalSet {
        !(SignalSet::of(SIGKILL) | SignalSet::of(SIGSTOP))
    }

    pub fn has(self, sig: u32) -> bool {
        self.contains(SignalSet::of(sig))
    }

    /// Lowest-numbered signal in the set.
    pub fn first(self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.bits().trailing_zeros() + 1)
        }
    }
}

/// What happens to a task when `sig` is delivered with no handler installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Ignore,
    Stop,
    Terminate,
}

pub fn default_action(sig: u32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGCONT => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}
