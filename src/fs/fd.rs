use alloc::sync::Arc;
use spin::Mutex;

use super::InodeRef;

/// An open file. Shared between processes after fork, closed when the
/// last handle goes away.
#[derive(Debug)]
pub struct File {
    pub inode: InodeRef,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
}

pub type FileRef = Arc<Mutex<File>>;

impl File {
    pub fn open(inode: InodeRef, readable: bool, writable: bool) -> FileRef {
        Arc::new(Mutex::new(File {
            inode,
            offset: 0,
            readable,
            writable,
        }))
    }
}
