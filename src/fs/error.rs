use core::fmt;

/// Failures reported by the file-system collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    NotFound,
    BadBlock(u32),
    DeviceError,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoError::NotFound => write!(f, "No such file"),
            IoError::BadBlock(nr) => write!(f, "Bad block {}", nr),
            IoError::DeviceError => write!(f, "Device error"),
        }
    }
}
