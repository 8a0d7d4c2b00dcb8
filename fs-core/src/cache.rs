//! Block cache implementation for tinyext
//!
//! The cache is strictly write-through: a write reaches the device before the
//! cached copy is updated, so the device is always authoritative.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, Result};

/// An LRU cache of recently read blocks in front of a block device
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    cache: Option<Mutex<LruCache<u64, Box<[u8]>>>>,
}

impl BlockCache {
    /// Create a new block cache with the given capacity (in blocks); zero disables caching
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let cache = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self { device, cache }
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    /// Read a block from the cache or device
    pub fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.lock().get(&block_num) {
                if block.len() == buf.len() {
                    buf.copy_from_slice(block);
                    return Ok(());
                }
            }
        }

        self.device.read_block(block_num, buf)?;

        if let Some(cache) = &self.cache {
            cache.lock().put(block_num, buf.to_vec().into_boxed_slice());
        }
        Ok(())
    }

    /// Read a whole block into a freshly allocated buffer
    pub fn read(&self, block_num: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size()];
        self.read_block(block_num, &mut buf)?;
        Ok(buf)
    }

    /// Write a block through to the device, then refresh the cached copy
    pub fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if let Err(e) = self.device.write_block(block_num, data) {
            // The device may have partially applied the write
            self.forget(block_num);
            return Err(e);
        }

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            if cache.contains(&block_num) {
                cache.put(block_num, data.to_vec().into_boxed_slice());
            }
        }
        Ok(())
    }

    /// Write a zero-filled block
    pub fn zero_block(&self, block_num: u64) -> Result<()> {
        self.write_block(block_num, &vec![0u8; self.block_size()])
    }

    /// Drop a cached block
    pub fn forget(&self, block_num: u64) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(&block_num);
        }
    }

    /// Drop every cached block
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    /// Sync the device so all writes are persisted
    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    /// Number of blocks currently cached
    pub fn cached_blocks(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.lock().len())
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_count", &self.block_count())
            .field("block_size", &self.block_size())
            .field("cached_blocks", &self.cached_blocks())
            .finish()
    }
}
