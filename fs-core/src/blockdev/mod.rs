//! Block device I/O operations for tinyext

mod blockdev_trait;

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, DEFAULT_BLOCK_SIZE};

/// A block device held entirely in process memory
#[derive(Debug)]
pub struct MemoryBlockDevice {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    block_count: u64,
}

impl MemoryBlockDevice {
    /// Create a zero-filled in-memory device
    pub fn new(block_count: u64, block_size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; block_count as usize * block_size]),
            block_size,
            block_count,
        }
    }

    fn range(&self, block_num: u64) -> std::ops::Range<usize> {
        let start = block_num as usize * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(block_num, buf.len())?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[self.range(block_num)]);
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        self.check_access(block_num, data.len())?;
        let range = self.range(block_num);
        self.data.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A block device that is backed by a disk image file
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<File>,
    path: PathBuf,
    block_size: usize,
    block_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file sized for `block_count` blocks
    pub fn create(path: impl AsRef<Path>, block_count: u64, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.set_len(block_count * block_size as u64)?;
        log::info!(
            "BLOCKDEV: Created image {} ({} blocks of {} bytes)",
            path.display(),
            block_count,
            block_size
        );

        Ok(Self {
            file: Mutex::new(file),
            path,
            block_size,
            block_count,
            read_only: false,
        })
    }

    /// Open an existing image file; trailing bytes short of a full block are ignored
    pub fn open(path: impl AsRef<Path>, block_size: usize, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;

        let size = file.metadata()?.len();
        let block_count = size / block_size as u64;

        Ok(Self {
            file: Mutex::new(file),
            path,
            block_size,
            block_count,
            read_only,
        })
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(block_num, buf.len())?;

        let offset = block_num * self.block_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        self.check_access(block_num, data.len())?;

        let offset = block_num * self.block_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
