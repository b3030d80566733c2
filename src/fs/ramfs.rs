//! In-memory program store.
//!
//! Files are laid out like the kernel's executable format: logical block 0
//! holds the header, text and initialised data follow from block 1 on.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::error::IoError;
use super::{BlockId, FileSystem, Inode, InodeRef, PageBlocks, ProgramHeader};
use crate::config::BLOCK_SIZE;

// ──────────────────────────────────────────────────────────────
//  Internal state
// ──────────────────────────────────────────────────────────────

struct RamFile {
    number: u32,
    /// Logical block -> disk block; `None` is a hole.
    block_map: Vec<Option<BlockId>>,
}

struct RamFsInner {
    /// Disk blocks, indexed by `BlockId - 1`. Block 0 means "no block".
    disk: Vec<[u8; BLOCK_SIZE]>,
    files: Vec<RamFile>,
    next_number: u32,
    block_reads: usize,
    fail_reads: bool,
}

impl RamFsInner {
    fn new() -> Self {
        RamFsInner {
            disk: Vec::new(),
            files: Vec::new(),
            next_number: 1,
            block_reads: 0,
            fail_reads: false,
        }
    }

    fn alloc_block(&mut self, content: &[u8]) -> BlockId {
        let mut block = [0u8; BLOCK_SIZE];
        block[..content.len()].copy_from_slice(content);
        self.disk.push(block);
        self.disk.len() as BlockId
    }

    fn find(&self, number: u32) -> Option<&RamFile> {
        self.files.iter().find(|f| f.number == number)
    }
}

// ──────────────────────────────────────────────────────────────
//  Public RamFs struct
// ──────────────────────────────────────────────────────────────

/// Cheap to clone; clones share the same disk.
#[derive(Clone)]
pub struct RamFs {
    dev: u16,
    inner: Arc<Mutex<RamFsInner>>,
}

impl RamFs {
    pub fn new(dev: u16) -> Self {
        RamFs {
            dev,
            inner: Arc::new(Mutex::new(RamFsInner::new())),
        }
    }

    /// Store a program image and return a handle to its inode.
    pub fn add_program(&self, text: &[u8], data: &[u8], bss_size: u32, entry: u32) -> (InodeRef, ProgramHeader) {
        let header = ProgramHeader {
            text_size: text.len() as u32,
            data_size: data.len() as u32,
            bss_size,
            entry,
        };

        let mut image = Vec::with_capacity(BLOCK_SIZE + text.len() + data.len());
        image.extend_from_slice(&header.text_size.to_le_bytes());
        image.extend_from_slice(&header.data_size.to_le_bytes());
        image.extend_from_slice(&header.bss_size.to_le_bytes());
        image.extend_from_slice(&header.entry.to_le_bytes());
        image.resize(BLOCK_SIZE, 0);
        image.extend_from_slice(text);
        image.extend_from_slice(data);

        let mut inner = self.inner.lock();
        let block_map = image
            .chunks(BLOCK_SIZE)
            .map(|chunk| Some(inner.alloc_block(chunk)))
            .collect();
        let number = inner.next_number;
        inner.next_number += 1;
        inner.files.push(RamFile { number, block_map });

        (Inode::new(self.dev, number), header)
    }

    /// Parse the header block of a stored program.
    pub fn read_header(&self, file: &Inode) -> Result<ProgramHeader, IoError> {
        let inner = self.inner.lock();
        let ram_file = inner.find(file.number).ok_or(IoError::NotFound)?;
        let block = ram_file.block_map.first().copied().flatten().ok_or(IoError::NotFound)?;
        let raw = &inner.disk[(block - 1) as usize];
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Ok(ProgramHeader {
            text_size: word(0),
            data_size: word(4),
            bss_size: word(8),
            entry: word(12),
        })
    }

    /// Total disk blocks read so far.
    pub fn block_reads(&self) -> usize {
        self.inner.lock().block_reads
    }

    /// Make every subsequent read fail with a device error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &str {
        "ramfs"
    }

    fn block_for_offset(&self, file: &Inode, logical_block: u32) -> Option<BlockId> {
        if file.dev != self.dev {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .find(file.number)?
            .block_map
            .get(logical_block as usize)
            .copied()
            .flatten()
    }

    fn read_blocks(&self, file: &Inode, blocks: &PageBlocks, dest: &mut [u8]) -> Result<(), IoError> {
        let mut inner = self.inner.lock();
        if inner.fail_reads {
            return Err(IoError::DeviceError);
        }
        if file.dev != self.dev || inner.find(file.number).is_none() {
            return Err(IoError::NotFound);
        }
        for (chunk, block) in dest.chunks_mut(BLOCK_SIZE).zip(blocks.iter()) {
            match block {
                Some(nr) => {
                    let raw = inner
                        .disk
                        .get((*nr as usize).wrapping_sub(1))
                        .ok_or(IoError::BadBlock(*nr))?;
                    chunk.copy_from_slice(raw);
                    inner.block_reads += 1;
                }
                None => chunk.fill(0),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn header_round_trips_through_block_zero() {
        let fs = RamFs::new(3);
        let (inode, header) = fs.add_program(&[0x90; 100], &[1, 2, 3], 64, 0x10);
        assert_eq!(fs.read_header(&inode), Ok(header));
        assert_eq!(header.text_size, 100);
        assert_eq!(header.data_size, 3);
    }

    #[test]
    fn reads_a_page_with_holes_past_the_end() {
        let fs = RamFs::new(3);
        let text: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let (inode, _) = fs.add_program(&text, &[], 0, 0);

        let blocks = [
            fs.block_for_offset(&inode, 1),
            fs.block_for_offset(&inode, 2),
            fs.block_for_offset(&inode, 3),
            fs.block_for_offset(&inode, 4),
        ];
        assert!(blocks[0].is_some() && blocks[1].is_some());
        assert_eq!(blocks[2], None);

        let mut page = vec![0xAAu8; PAGE_SIZE];
        fs.read_blocks(&inode, &blocks, &mut page).unwrap();
        assert_eq!(&page[..1500], &text[..]);
        assert!(page[2048..].iter().all(|&b| b == 0));
        assert_eq!(fs.block_reads(), 2);
    }

    #[test]
    fn injected_failures_surface_as_device_errors() {
        let fs = RamFs::new(1);
        let (inode, _) = fs.add_program(&[1; 10], &[], 0, 0);
        fs.set_fail_reads(true);
        let mut page = vec![0u8; PAGE_SIZE];
        assert_eq!(fs.read_blocks(&inode, &[None; 4], &mut page), Err(IoError::DeviceError));
    }

    #[test]
    fn foreign_device_has_no_blocks() {
        let fs = RamFs::new(1);
        let (_, _) = fs.add_program(&[1; 10], &[], 0, 0);
        let stranger = Inode::new(9, 1);
        assert_eq!(fs.block_for_offset(&stranger, 0), None);
    }
}
