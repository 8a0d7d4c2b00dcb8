//! Allocation bitmap for tinyext
//!
//! One bit per resource, bit set = allocated. The bitmap occupies a run of
//! consecutive disk blocks; single-bit changes are persisted by rewriting only
//! the block that holds the bit.

use crate::cache::BlockCache;
use crate::error::Result;

/// A persistent bitmap
#[derive(Clone)]
pub struct Bitmap {
    /// Bitmap data (each bit represents one resource)
    bits: Vec<u8>,
    /// Number of resources tracked
    len: u64,
    /// First disk block holding the bitmap
    start_block: u64,
    /// Block size of the backing device
    block_size: usize,
}

impl Bitmap {
    /// Create an all-clear bitmap spanning `blocks` disk blocks from `start_block`
    pub fn new(len: u64, start_block: u64, blocks: u64, block_size: usize) -> Self {
        Self {
            bits: vec![0u8; blocks as usize * block_size],
            len,
            start_block,
            block_size,
        }
    }

    /// Load bitmap from disk
    pub fn load(
        cache: &BlockCache,
        len: u64,
        start_block: u64,
        blocks: u64,
    ) -> Result<Self> {
        let block_size = cache.block_size();
        let mut bits = Vec::with_capacity(blocks as usize * block_size);
        for block in start_block..start_block + blocks {
            bits.extend_from_slice(&cache.read(block)?);
        }
        Ok(Self {
            bits,
            len,
            start_block,
            block_size,
        })
    }

    /// Write every bitmap block to disk
    pub fn store(&self, cache: &BlockCache) -> Result<()> {
        for (offset, chunk) in self.bits.chunks(self.block_size).enumerate() {
            cache.write_block(self.start_block + offset as u64, chunk)?;
        }
        Ok(())
    }

    /// Write the single block containing `index`
    pub fn store_bit(&self, cache: &BlockCache, index: u64) -> Result<()> {
        let chunk = (index / 8) as usize / self.block_size;
        let start = chunk * self.block_size;
        cache.write_block(
            self.start_block + chunk as u64,
            &self.bits[start..start + self.block_size],
        )?;
        Ok(())
    }

    /// Number of resources tracked
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if a resource is allocated; out-of-range indexes read as clear
    pub fn get(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = self.bits[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    /// Modify occupancy, returning the previous value
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let byte = &mut self.bits[(index / 8) as usize];
        let mask = 1u8 << (index % 8);
        let previous = *byte & mask != 0;
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        previous
    }

    /// Find the first clear bit at or after `from`
    pub fn first_clear(&self, from: u64) -> Option<u64> {
        let mut index = from;
        while index < self.len {
            let byte = self.bits[(index / 8) as usize];
            if byte == 0xFF && index % 8 == 0 {
                index += 8;
                continue;
            }
            if byte & (1 << (index % 8)) == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Population count over the tracked range
    pub fn count_ones(&self) -> u64 {
        let full_bytes = (self.len / 8) as usize;
        let mut count: u64 = self.bits[..full_bytes]
            .iter()
            .map(|b| b.count_ones() as u64)
            .sum();
        for index in (full_bytes as u64 * 8)..self.len {
            if self.get(index) {
                count += 1;
            }
        }
        count
    }

    /// Indexes of every set bit, ascending
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .field("start_block", &self.start_block)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use std::sync::Arc;

    #[test]
    fn test_set_and_get() {
        let mut bitmap = Bitmap::new(100, 1, 1, 512);

        assert!(!bitmap.set(0, true));
        assert!(!bitmap.set(9, true));
        assert!(bitmap.get(0));
        assert!(bitmap.get(9));
        assert!(!bitmap.get(8));
        assert_eq!(bitmap.count_ones(), 2);

        assert!(bitmap.set(9, false));
        assert!(!bitmap.get(9));
        assert!(!bitmap.get(5000));
    }

    #[test]
    fn test_first_clear() {
        let mut bitmap = Bitmap::new(20, 1, 1, 512);
        for i in 0..17 {
            bitmap.set(i, true);
        }
        assert_eq!(bitmap.first_clear(0), Some(17));
        assert_eq!(bitmap.first_clear(18), Some(18));

        for i in 17..20 {
            bitmap.set(i, true);
        }
        assert_eq!(bitmap.first_clear(0), None);
    }

    #[test]
    fn test_count_ignores_padding_bits() {
        let mut bitmap = Bitmap::new(10, 1, 1, 512);
        bitmap.set(9, true);
        assert_eq!(bitmap.count_ones(), 1);
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_persistence() {
        let device = Arc::new(MemoryBlockDevice::new(8, 512));
        let cache = BlockCache::new(device, 0);

        // 6000 bits span two 512-byte blocks
        let mut bitmap = Bitmap::new(6000, 2, 2, 512);
        bitmap.set(3, true);
        bitmap.set(5000, true);
        bitmap.store(&cache).unwrap();

        bitmap.set(4999, true);
        bitmap.store_bit(&cache, 4999).unwrap();

        let loaded = Bitmap::load(&cache, 6000, 2, 2).unwrap();
        assert!(loaded.get(3));
        assert!(loaded.get(4999));
        assert!(loaded.get(5000));
        assert_eq!(loaded.count_ones(), 3);
    }
}
