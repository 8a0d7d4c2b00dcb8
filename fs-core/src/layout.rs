//! On-disk layout definitions for tinyext
//!
//! One contiguous image, in block order:
//! superblock | inode bitmap | block bitmap | inode table | data blocks

use crate::format::INODE_SIZE;
use crate::DIRECT_BLOCKS;

/// Block numbers for important filesystem structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Block size in bytes
    pub block_size: u64,
    /// Total number of blocks on the disk
    pub block_count: u64,
    /// Number of inode table slots, including the reserved slot 0
    pub inode_count: u64,
    /// Block number of the superblock (always block 0)
    pub superblock: u64,
    /// Block number of the inode bitmap
    pub inode_bitmap: u64,
    /// Number of blocks in the inode bitmap
    pub inode_bitmap_blocks: u64,
    /// Block number of the block bitmap
    pub block_bitmap: u64,
    /// Number of blocks in the block bitmap
    pub block_bitmap_blocks: u64,
    /// Block number of the inode table
    pub inode_table: u64,
    /// Number of blocks in the inode table
    pub inode_table_blocks: u64,
    /// Block number of the first data block
    pub data_blocks: u64,
    /// Total number of data blocks
    pub data_blocks_count: u64,
}

impl Layout {
    /// Calculate the layout for a filesystem with the given parameters
    pub fn new(block_size: u64, block_count: u64, inode_count: u64) -> Self {
        let bits_per_block = block_size * 8;

        let superblock = 0;

        let inode_bitmap = superblock + 1;
        let inode_bitmap_blocks = inode_count.div_ceil(bits_per_block);

        let block_bitmap = inode_bitmap + inode_bitmap_blocks;
        let block_bitmap_blocks = block_count.div_ceil(bits_per_block);

        let inode_table = block_bitmap + block_bitmap_blocks;
        let inode_table_blocks = (inode_count * INODE_SIZE as u64).div_ceil(block_size);

        let data_blocks = inode_table + inode_table_blocks;
        let data_blocks_count = block_count.saturating_sub(data_blocks);

        Self {
            block_size,
            block_count,
            inode_count,
            superblock,
            inode_bitmap,
            inode_bitmap_blocks,
            block_bitmap,
            block_bitmap_blocks,
            inode_table,
            inode_table_blocks,
            data_blocks,
            data_blocks_count,
        }
    }

    /// Blocks permanently reserved for metadata (everything before the data region)
    pub fn metadata_blocks(&self) -> u64 {
        self.data_blocks
    }

    /// Whether `block` lies inside the data region
    pub fn is_data_block(&self, block: u64) -> bool {
        block >= self.data_blocks && block < self.block_count
    }

    pub fn inodes_per_block(&self) -> u64 {
        self.block_size / INODE_SIZE as u64
    }

    /// Get the block number and byte offset for a given inode number
    pub fn inode_block(&self, inode_num: u64) -> (u64, usize) {
        let per_block = self.inodes_per_block();
        let block_offset = inode_num / per_block;
        let inode_offset = (inode_num % per_block) as usize * INODE_SIZE;
        (self.inode_table + block_offset, inode_offset)
    }

    /// Number of block ids one indirect block can hold
    pub fn pointers_per_block(&self) -> u64 {
        self.block_size / 4
    }

    /// Largest number of data blocks a single inode can reference
    pub fn max_file_blocks(&self) -> u64 {
        DIRECT_BLOCKS as u64 + self.pointers_per_block()
    }

    /// Largest file size in bytes
    pub fn max_file_size(&self) -> u64 {
        self.max_file_blocks() * self.block_size
    }
}
