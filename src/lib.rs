#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod scheduler;
pub mod serial;
pub mod syscalls;

use alloc::boxed::Box;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::idt::PageFaultErrorCode;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;

use arch::Platform;
use fs::FileSystem;
use memory::fault::FaultKind;
use syscalls::Outcome;

/// The kernel as the trap handlers see it.
pub type GlobalKernel = Kernel<Box<dyn Platform + Send>>;

lazy_static! {
    static ref KERNEL: Mutex<Option<GlobalKernel>> = Mutex::new(None);
}

/// Boot the kernel and make it the target of the trap entry points below.
pub fn install(config: KernelConfig, fs: Box<dyn FileSystem>, platform: Box<dyn Platform + Send>) -> KernelResult<()> {
    let kernel = Kernel::boot(config, fs, platform)?;
    arch::without_interrupts(|| {
        *KERNEL.lock() = Some(kernel);
    });
    log_info!("AtomicOS kernel core installed.");
    Ok(())
}

/// Run `f` on the installed kernel with interrupts masked. `None` before
/// [`install`].
pub fn with_kernel<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut GlobalKernel) -> R,
{
    arch::without_interrupts(|| KERNEL.lock().as_mut().map(f))
}

/// Timer trap. `user_mode` is taken from the interrupted code segment.
pub fn on_timer_interrupt(user_mode: bool) {
    with_kernel(|k| {
        k.tick(user_mode);
        if user_mode {
            k.deliver_signals();
        }
    });
}

/// Page-fault trap at linear address `addr`.
pub fn on_page_fault(addr: u32, code: PageFaultErrorCode) -> KernelResult<()> {
    with_kernel(|k| k.page_fault(addr, FaultKind::from(code))).unwrap_or(Err(KernelError::InvalidArgument))
}

/// `int 0x80` trap; the call is described by the current task's saved
/// registers.
pub fn on_syscall() -> Option<Outcome> {
    with_kernel(syscalls::dispatch)
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
