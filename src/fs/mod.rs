//! File-system collaborator boundary.
//!
//! The memory manager only needs to map a program's logical blocks to disk
//! blocks and read four of them into a frame. Open files, the working and
//! root directories and the backing executable are reference-counted
//! handles; cloning one is the `i_count++` of a fork, dropping it the `iput`.

pub mod error;
pub mod fd;
pub mod ramfs;

use alloc::sync::Arc;

use crate::config::BLOCKS_PER_PAGE;

pub use error::IoError;
pub use fd::{File, FileRef};

/// Disk block number as returned by the block map.
pub type BlockId = u32;

/// Blocks covering one page of a program, in file order. `None` is a hole.
pub type PageBlocks = [Option<BlockId>; BLOCKS_PER_PAGE];

/// In-core inode identity.
#[derive(Debug, PartialEq, Eq)]
pub struct Inode {
    pub dev: u16,
    pub number: u32,
}

/// Shared inode handle. The strong count is the inode's use count.
pub type InodeRef = Arc<Inode>;

impl Inode {
    pub fn new(dev: u16, number: u32) -> InodeRef {
        Arc::new(Inode { dev, number })
    }
}

/// Number of live handles to `inode` (the original `i_count`).
pub fn use_count(inode: &InodeRef) -> usize {
    Arc::strong_count(inode)
}

/// Operations the memory manager consumes from the file system.
pub trait FileSystem: Send {
    /// Name of this filesystem (e.g. "ramfs").
    fn name(&self) -> &str;

    /// Disk block holding logical block `logical_block` of `file`.
    fn block_for_offset(&self, file: &Inode, logical_block: u32) -> Option<BlockId>;

    /// Fill `dest` (one page) with `blocks`. Holes read as zeroes.
    fn read_blocks(&self, file: &Inode, blocks: &PageBlocks, dest: &mut [u8]) -> Result<(), IoError>;
}

/// Sizes and entry point read from a program's header block. Header
/// parsing itself belongs to the loader; the memory manager only consumes
/// these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    pub text_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub entry: u32,
}
