use core::fmt;

use crate::fs::IoError;

/// Recoverable kernel errors. Corrupted-state conditions panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    TryAgain,
    NoChild,
    WouldBlock,
    Interrupted,
    NoSuchProcess,
    InvalidArgument,
    PermissionDenied,
    Io(IoError),
    SegmentViolation,
    Terminated,
    NoSuchCall,
}

impl KernelError {
    /// Negative return value stored into the caller's `eax`.
    pub fn errno(&self) -> i32 {
        let code = match self {
            KernelError::PermissionDenied => 1,
            KernelError::NoSuchProcess => 3,
            KernelError::Interrupted => 4,
            KernelError::Io(_) => 5,
            KernelError::NoChild => 10,
            KernelError::TryAgain | KernelError::WouldBlock => 11,
            KernelError::OutOfMemory => 12,
            KernelError::SegmentViolation | KernelError::Terminated => 14,
            KernelError::InvalidArgument => 22,
            KernelError::NoSuchCall => 38,
        };
        -code
    }
}

impl From<IoError> for KernelError {
    fn from(err: IoError) -> Self {
        KernelError::Io(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::TryAgain => write!(f, "No free process slot"),
            KernelError::NoChild => write!(f, "No child processes"),
            KernelError::WouldBlock => write!(f, "Operation would block"),
            KernelError::Interrupted => write!(f, "Interrupted by signal"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::PermissionDenied => write!(f, "Operation not permitted"),
            KernelError::Io(err) => write!(f, "I/O error: {}", err),
            KernelError::SegmentViolation => write!(f, "Address outside segment"),
            KernelError::Terminated => write!(f, "Process was terminated"),
            KernelError::NoSuchCall => write!(f, "Function not implemented"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
