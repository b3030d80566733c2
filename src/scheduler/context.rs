use x86_64::structures::paging::PhysFrame;

/// User code selector (LDT entry 1, RPL 3).
pub const USER_CS: u32 = 0x0f;
/// User data/stack selector (LDT entry 2, RPL 3).
pub const USER_DS: u32 = 0x17;
/// Interrupt-enable flag plus the always-one bit.
pub const USER_EFLAGS: u32 = 0x202;

/// Register file saved when a task enters the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
}

/// Everything a context switch restores: registers plus the page directory
/// that becomes the active translation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub frame: TrapFrame,
    pub root: PhysFrame,
}

impl Context {
    /// Fresh user-mode context starting at `eip` with stack `esp`.
    pub fn new(root: PhysFrame, eip: u32, esp: u32) -> Self {
        Context {
            frame: TrapFrame {
                eip,
                esp,
                eflags: USER_EFLAGS,
                cs: USER_CS,
                ss: USER_DS,
                ds: USER_DS,
                es: USER_DS,
                fs: USER_DS,
                gs: USER_DS,
                ..TrapFrame::default()
            },
            root,
        }
    }

    /// The child's copy of a parent context after fork: same registers,
    /// its own page directory, and 0 as the return value.
    pub fn forked(&self, root: PhysFrame) -> Self {
        let mut frame = self.frame;
        frame.eax = 0;
        Context { frame, root }
    }
}
