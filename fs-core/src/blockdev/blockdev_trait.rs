//! Block device trait definitions for tinyext

use std::io;
use thiserror::Error;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {actual} (expected {expected})")]
    InvalidBlockSize { actual: usize, expected: usize },
    #[error("Device is read-only")]
    ReadOnly,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// A fixed-size array of fixed-size blocks addressed by id.
///
/// Every successful `write_block` is durable in the backing store before it
/// returns; implementations must not buffer writes.
pub trait BlockDevice: Send + Sync + 'static {
    /// Read a block from the device
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write a block to the device
    fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Get the total number of blocks in the device
    fn block_count(&self) -> u64;

    /// Get the block size in bytes
    fn block_size(&self) -> usize;

    /// Sync any pending writes to the device
    fn sync(&self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }

    /// Validate a block id and buffer length against the device geometry
    fn check_access(&self, block_num: u64, len: usize) -> Result<()> {
        if block_num >= self.block_count() {
            return Err(BlockDeviceError::InvalidBlockNumber(block_num));
        }
        if len != self.block_size() {
            return Err(BlockDeviceError::InvalidBlockSize {
                actual: len,
                expected: self.block_size(),
            });
        }
        Ok(())
    }
}
