//! `int 0x80` entry: decodes the saved registers of the calling task and
//! routes to the process-management calls.

use crate::arch::Platform;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::scheduler::signal::SignalSet;
use crate::scheduler::{ExitStatus, WaitOptions, WaitTarget};

/// Syscall numbers (passed in EAX from userland).
pub const SYS_EXIT: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_WAITPID: u32 = 7;
pub const SYS_GETPID: u32 = 20;
pub const SYS_ALARM: u32 = 27;
pub const SYS_PAUSE: u32 = 29;
pub const SYS_NICE: u32 = 34;
pub const SYS_KILL: u32 = 37;
pub const SYS_GETPPID: u32 = 64;
pub const SYS_SETSID: u32 = 66;
pub const SYS_SGETMASK: u32 = 68;
pub const SYS_SSETMASK: u32 = 69;

/// Length of the `int 0x80` instruction.
const INT80_LEN: u32 = 2;

/// How a system call left its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Value stored into the caller's EAX.
    Return(i32),
    /// The caller blocked; it re-executes the call when it runs again.
    Restart,
    /// The caller blocked; it finds this value in EAX when it runs again.
    Blocked(i32),
    /// The caller is gone.
    NoReturn,
}

/// Central syscall dispatcher, called from the `int 0x80` handler.
/// Arguments come from the caller's saved registers: eax=number, ebx=arg0,
/// ecx=arg1, edx=arg2. Pending signals are acted on before returning to
/// whichever task ends up current.
pub fn dispatch<P: Platform>(k: &mut Kernel<P>) -> Outcome {
    let caller = k.tasks.task_ref(k.current_slot());
    let regs = k.current().context.frame;

    let outcome = match regs.eax {
        SYS_EXIT => {
            k.exit(ExitStatus::exited(regs.ebx as i32));
            Outcome::NoReturn
        }
        SYS_FORK => result(k.fork().map(|pid| pid.0)),
        SYS_WAITPID => sys_waitpid(k, regs.ebx as i32, regs.ecx, regs.edx),
        SYS_GETPID => Outcome::Return(k.getpid().0),
        SYS_ALARM => Outcome::Return(k.alarm(regs.ebx) as i32),
        SYS_PAUSE => {
            k.pause();
            Outcome::Blocked(KernelError::Interrupted.errno())
        }
        SYS_NICE => {
            k.nice(regs.ebx as i32);
            Outcome::Return(0)
        }
        SYS_KILL => result(k.kill(regs.ebx as i32, regs.ecx).map(|_| 0)),
        SYS_GETPPID => Outcome::Return(k.getppid().0),
        SYS_SETSID => result(k.setsid().map(|pgrp| pgrp.0)),
        SYS_SGETMASK => Outcome::Return(k.signal_mask().bits() as i32),
        SYS_SSETMASK => {
            let old = k.set_signal_mask(SignalSet::from_bits_truncate(regs.ebx));
            Outcome::Return(old.bits() as i32)
        }
        number => {
            crate::log_warn!("syscall: unknown number {} from pid {}", number, k.current_pid());
            Outcome::Return(KernelError::NoSuchCall.errno())
        }
    };

    if let Some(p) = caller.and_then(|task| k.tasks.get_mut(task)) {
        match outcome {
            Outcome::Return(value) | Outcome::Blocked(value) => p.context.frame.eax = value as u32,
            Outcome::Restart => p.context.frame.eip = p.context.frame.eip.wrapping_sub(INT80_LEN),
            Outcome::NoReturn => {}
        }
    }
    k.deliver_signals();
    outcome
}

fn result(value: Result<i32, KernelError>) -> Outcome {
    Outcome::Return(value.unwrap_or_else(|err| err.errno()))
}

fn sys_waitpid<P: Platform>(k: &mut Kernel<P>, pid: i32, stat_addr: u32, options: u32) -> Outcome {
    let options = WaitOptions::from_bits_truncate(options);
    match k.wait(WaitTarget::from(pid), options) {
        Ok((child, status)) => {
            if stat_addr != 0 {
                let stored = k
                    .verify_user_write(stat_addr, 4)
                    .and_then(|_| k.write_user_u32(stat_addr, status.0));
                match stored {
                    Ok(()) => {}
                    Err(KernelError::Terminated) => return Outcome::NoReturn,
                    Err(err) => return Outcome::Return(err.errno()),
                }
            }
            Outcome::Return(child.0)
        }
        Err(KernelError::WouldBlock) if options.contains(WaitOptions::NOHANG) => Outcome::Return(0),
        Err(KernelError::WouldBlock) => Outcome::Restart,
        Err(err) => Outcome::Return(err.errno()),
    }
}

/// Issue system call `nr` as the current task would, with `ebx`, `ecx` and
/// `edx` as arguments. Returns the value left in the caller's EAX, or
/// `None` if the caller blocked or exited.
pub fn syscall<P: Platform>(k: &mut Kernel<P>, nr: u32, ebx: u32, ecx: u32, edx: u32) -> Option<i32> {
    let frame = &mut k.current_mut().context.frame;
    frame.eax = nr;
    frame.ebx = ebx;
    frame.ecx = ecx;
    frame.edx = edx;
    match dispatch(k) {
        Outcome::Return(value) => Some(value),
        Outcome::Restart | Outcome::Blocked(_) | Outcome::NoReturn => None,
    }
}
