//! Block and inode allocation for tinyext
//!
//! The allocator owns both bitmaps and the superblock counters. Each
//! allocate/free flips the bit and adjusts the matching counter in one step,
//! then persists the touched bitmap block followed by the superblock.

use crate::bitmap::Bitmap;
use crate::cache::BlockCache;
use crate::error::{FsError, Resource, Result};
use crate::format::Superblock;
use crate::layout::Layout;

/// Inode slot 0 is never handed out; a zero inode number means "none"
pub const NULL_INODE: u64 = 0;

/// Tracks free/used blocks and inodes
#[derive(Debug, Clone)]
pub struct Allocator {
    layout: Layout,
    superblock: Superblock,
    inodes: Bitmap,
    blocks: Bitmap,
}

impl Allocator {
    /// Reset both bitmaps for a fresh disk, reserving metadata blocks and inode slot 0
    pub fn format(cache: &BlockCache, layout: Layout, mut superblock: Superblock) -> Result<Self> {
        let block_size = layout.block_size as usize;
        let mut inodes = Bitmap::new(
            layout.inode_count,
            layout.inode_bitmap,
            layout.inode_bitmap_blocks,
            block_size,
        );
        let mut blocks = Bitmap::new(
            layout.block_count,
            layout.block_bitmap,
            layout.block_bitmap_blocks,
            block_size,
        );

        inodes.set(NULL_INODE, true);
        for block in 0..layout.metadata_blocks() {
            blocks.set(block, true);
        }

        superblock.free_inodes = layout.inode_count - inodes.count_ones();
        superblock.free_blocks = layout.block_count - blocks.count_ones();

        inodes.store(cache)?;
        blocks.store(cache)?;
        superblock.store(cache)?;

        log::info!(
            "ALLOC: Initialized bitmaps - {} metadata blocks reserved, {} free blocks, {} free inodes",
            layout.metadata_blocks(),
            superblock.free_blocks,
            superblock.free_inodes
        );

        Ok(Self {
            layout,
            superblock,
            inodes,
            blocks,
        })
    }

    /// Load both bitmaps from disk and verify them against the superblock counters
    pub fn load(cache: &BlockCache, layout: Layout, superblock: Superblock) -> Result<Self> {
        let inodes = Bitmap::load(
            cache,
            layout.inode_count,
            layout.inode_bitmap,
            layout.inode_bitmap_blocks,
        )?;
        let blocks = Bitmap::load(
            cache,
            layout.block_count,
            layout.block_bitmap,
            layout.block_bitmap_blocks,
        )?;

        let free_inodes = layout.inode_count - inodes.count_ones();
        let free_blocks = layout.block_count - blocks.count_ones();
        if free_inodes != superblock.free_inodes || free_blocks != superblock.free_blocks {
            return Err(FsError::Corrupt(format!(
                "superblock counters ({} free blocks, {} free inodes) disagree with bitmaps ({}, {})",
                superblock.free_blocks, superblock.free_inodes, free_blocks, free_inodes
            )));
        }

        log::info!(
            "ALLOC: Loaded from disk - {} free blocks, {} free inodes",
            free_blocks,
            free_inodes
        );

        Ok(Self {
            layout,
            superblock,
            inodes,
            blocks,
        })
    }

    /// Allocate the lowest free data block
    pub fn allocate_block(&mut self, cache: &BlockCache) -> Result<u64> {
        if self.superblock.free_blocks == 0 {
            log::warn!("ALLOC: No free blocks available");
            return Err(FsError::DiskFull);
        }
        let block = self
            .blocks
            .first_clear(self.layout.data_blocks)
            .ok_or(FsError::DiskFull)?;

        self.blocks.set(block, true);
        self.superblock.free_blocks -= 1;
        self.commit(cache, Resource::Block(block))?;

        log::debug!(
            "ALLOC: Allocated block {}, {} free remaining",
            block,
            self.superblock.free_blocks
        );
        Ok(block)
    }

    /// Release a data block
    pub fn free_block(&mut self, cache: &BlockCache, block: u64) -> Result<()> {
        if block >= self.layout.block_count {
            return Err(FsError::OutOfRange(block));
        }
        if !self.layout.is_data_block(block) {
            return Err(FsError::InvalidArgument(format!(
                "block {} is reserved metadata",
                block
            )));
        }
        if !self.blocks.get(block) {
            return Err(FsError::DoubleFree(Resource::Block(block)));
        }

        self.blocks.set(block, false);
        self.superblock.free_blocks += 1;
        self.commit(cache, Resource::Block(block))?;

        log::debug!(
            "ALLOC: Freed block {}, {} free total",
            block,
            self.superblock.free_blocks
        );
        Ok(())
    }

    /// Allocate the lowest free inode number
    pub fn allocate_inode(&mut self, cache: &BlockCache) -> Result<u64> {
        if self.superblock.free_inodes == 0 {
            log::warn!("ALLOC: Inode table is full");
            return Err(FsError::InodeTableFull);
        }
        let inode = self.inodes.first_clear(1).ok_or(FsError::InodeTableFull)?;

        self.inodes.set(inode, true);
        self.superblock.free_inodes -= 1;
        self.commit(cache, Resource::Inode(inode))?;

        log::debug!(
            "ALLOC: Allocated inode {}, {} free remaining",
            inode,
            self.superblock.free_inodes
        );
        Ok(inode)
    }

    /// Release an inode number
    pub fn free_inode(&mut self, cache: &BlockCache, inode: u64) -> Result<()> {
        if inode == NULL_INODE || inode >= self.layout.inode_count {
            return Err(FsError::InvalidArgument(format!(
                "inode {} is not allocatable",
                inode
            )));
        }
        if !self.inodes.get(inode) {
            return Err(FsError::DoubleFree(Resource::Inode(inode)));
        }

        self.inodes.set(inode, false);
        self.superblock.free_inodes += 1;
        self.commit(cache, Resource::Inode(inode))?;

        log::debug!(
            "ALLOC: Freed inode {}, {} free total",
            inode,
            self.superblock.free_inodes
        );
        Ok(())
    }

    fn commit(&mut self, cache: &BlockCache, changed: Resource) -> Result<()> {
        match changed {
            Resource::Block(block) => self.blocks.store_bit(cache, block)?,
            Resource::Inode(inode) => self.inodes.store_bit(cache, inode)?,
        }
        self.superblock.last_write = chrono::Utc::now().timestamp();
        self.superblock.store(cache)
    }

    pub fn is_block_allocated(&self, block: u64) -> bool {
        self.blocks.get(block)
    }

    pub fn is_inode_allocated(&self, inode: u64) -> bool {
        self.inodes.get(inode)
    }

    /// Get the number of free blocks
    pub fn free_blocks(&self) -> u64 {
        self.superblock.free_blocks
    }

    /// Get the number of free inodes
    pub fn free_inodes(&self) -> u64 {
        self.superblock.free_inodes
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn block_bitmap(&self) -> &Bitmap {
        &self.blocks
    }

    pub fn inode_bitmap(&self) -> &Bitmap {
        &self.inodes
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}
