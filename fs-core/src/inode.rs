//! Inode table for tinyext
//!
//! Inodes live in fixed 128-byte slots of the inode table region. Each inode
//! maps its content through up to [`DIRECT_BLOCKS`] direct block ids and one
//! optional single indirect block holding further ids.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;

use crate::alloc::Allocator;
use crate::cache::BlockCache;
use crate::error::{FsError, Result};
use crate::format::{InodeRecord, Superblock, INODE_SIZE};
use crate::layout::Layout;
use crate::perm::{Credentials, Mode};
use crate::{DIRECT_BLOCKS, ROOT_INODE};

/// Inode number
pub type InodeId = u64;
/// Block number
pub type BlockId = u64;

/// What an inode describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    /// On-disk code; 0 marks a free slot
    pub fn code(self) -> u8 {
        match self {
            InodeKind::File => 1,
            InodeKind::Directory => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(InodeKind::File),
            2 => Some(InodeKind::Directory),
            _ => None,
        }
    }
}

/// Block references of one inode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    /// Direct block ids in content order, at most [`DIRECT_BLOCKS`]
    pub direct: Vec<BlockId>,
    /// Block holding the ids of content blocks past the direct ones
    pub indirect: Option<BlockId>,
}

/// In-memory snapshot of an inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub kind: InodeKind,
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
    /// Number of directory entries naming this inode
    pub links: u16,
    /// Content size in bytes
    pub size: u64,
    pub created: i64,
    pub modified: i64,
    pub blocks: BlockMap,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    /// Number of content blocks the size calls for
    pub fn block_count(&self, block_size: u64) -> u64 {
        self.size.div_ceil(block_size)
    }

    fn from_record(id: InodeId, record: &InodeRecord) -> Result<Self> {
        let kind = InodeKind::from_code(record.kind).ok_or_else(|| {
            FsError::Corrupt(format!("inode {} has unknown kind code {}", id, record.kind))
        })?;
        let direct = record
            .direct
            .iter()
            .take_while(|&&block| block != 0)
            .map(|&block| block as BlockId)
            .collect();
        let indirect = (record.indirect != 0).then_some(record.indirect as BlockId);

        Ok(Self {
            id,
            kind,
            mode: Mode::from_raw(record.mode),
            uid: record.uid,
            gid: record.gid,
            links: record.links,
            size: record.size,
            created: record.created,
            modified: record.modified,
            blocks: BlockMap { direct, indirect },
        })
    }

    fn to_record(&self) -> InodeRecord {
        let mut direct = [0u32; DIRECT_BLOCKS];
        for (slot, &block) in direct.iter_mut().zip(&self.blocks.direct) {
            *slot = block as u32;
        }
        InodeRecord {
            kind: self.kind.code(),
            mode: self.mode.bits(),
            uid: self.uid,
            gid: self.gid,
            links: self.links,
            size: self.size,
            created: self.created,
            modified: self.modified,
            direct,
            indirect: self.blocks.indirect.unwrap_or(0) as u32,
        }
    }
}

/// Fixed-capacity table of inodes on top of the allocator
pub struct InodeTable {
    cache: BlockCache,
    layout: Layout,
    alloc: Allocator,
    /// Open-handle count per inode
    pins: HashMap<InodeId, usize>,
}

impl InodeTable {
    pub fn new(cache: BlockCache, layout: Layout, alloc: Allocator) -> Self {
        Self {
            cache,
            layout,
            alloc,
            pins: HashMap::new(),
        }
    }

    /// Open an already formatted disk
    pub fn mount(cache: BlockCache) -> Result<Self> {
        let superblock = Superblock::load(&cache)?;

        if superblock.block_size as usize != cache.block_size() {
            return Err(FsError::Corrupt(format!(
                "superblock block size {} does not match device block size {}",
                superblock.block_size,
                cache.block_size()
            )));
        }
        if superblock.block_count > cache.block_count() {
            return Err(FsError::Corrupt(format!(
                "superblock claims {} blocks, device holds {}",
                superblock.block_count,
                cache.block_count()
            )));
        }
        if superblock.root_inode != ROOT_INODE || superblock.direct_blocks != DIRECT_BLOCKS as u32 {
            return Err(FsError::Corrupt(
                "superblock geometry is not supported".into(),
            ));
        }

        let layout = Layout::new(
            superblock.block_size as u64,
            superblock.block_count,
            superblock.inode_count,
        );
        let alloc = Allocator::load(&cache, layout, superblock)?;
        let table = Self::new(cache, layout, alloc);

        let root = table.get(ROOT_INODE)?;
        if !root.is_dir() {
            return Err(FsError::Corrupt("root inode is not a directory".into()));
        }

        log::info!(
            "INODE: Mounted volume '{}' ({} blocks of {} bytes)",
            table.alloc.superblock().volume_name(),
            layout.block_count,
            layout.block_size
        );
        Ok(table)
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size as usize
    }

    /// Read the raw slot for `id`, whether or not it is allocated
    pub fn read_record(&self, id: InodeId) -> Result<InodeRecord> {
        if id >= self.layout.inode_count {
            return Err(FsError::NotFound);
        }
        let (block, offset) = self.layout.inode_block(id);
        let data = self.cache.read(block)?;
        let record = InodeRecord::read_from(&mut Cursor::new(&data[offset..offset + INODE_SIZE]))?;
        Ok(record)
    }

    fn write_record(&self, id: InodeId, record: &InodeRecord) -> Result<()> {
        let (block, offset) = self.layout.inode_block(id);
        let mut data = self.cache.read(block)?;
        record.write_to(&mut Cursor::new(&mut data[offset..offset + INODE_SIZE]))?;
        self.cache.write_block(block, &data)?;
        Ok(())
    }

    fn store(&self, inode: &Inode) -> Result<()> {
        log::debug!(
            "INODE: Writing inode {} (size={}, links={}, blocks={})",
            inode.id,
            inode.size,
            inode.links,
            inode.blocks.direct.len()
        );
        self.write_record(inode.id, &inode.to_record())
    }

    /// Allocate a zero-length inode; links start at 0 until an entry names it
    pub fn allocate(&mut self, kind: InodeKind, mode: Mode, owner: &Credentials) -> Result<InodeId> {
        let id = self.alloc.allocate_inode(&self.cache)?;
        let now = chrono::Utc::now().timestamp();
        let inode = Inode {
            id,
            kind,
            mode,
            uid: owner.uid,
            gid: owner.gid,
            links: 0,
            size: 0,
            created: now,
            modified: now,
            blocks: BlockMap::default(),
        };

        if let Err(e) = self.store(&inode) {
            if let Err(undo) = self.alloc.free_inode(&self.cache, id) {
                log::error!("INODE: Could not release inode {} after failed store: {}", id, undo);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Snapshot of an allocated inode
    pub fn get(&self, id: InodeId) -> Result<Inode> {
        if id == 0 || id >= self.layout.inode_count || !self.alloc.is_inode_allocated(id) {
            return Err(FsError::NotFound);
        }
        Inode::from_record(id, &self.read_record(id)?)
    }

    /// Apply `mutate` to an inode and persist the result
    pub fn update<R, F>(&mut self, id: InodeId, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut Inode) -> R,
    {
        let mut inode = self.get(id)?;
        let result = mutate(&mut inode);
        self.store(&inode)?;
        Ok(result)
    }

    /// Release an inode's blocks and then the inode itself
    pub fn free(&mut self, id: InodeId) -> Result<()> {
        let inode = self.get(id)?;
        if inode.links > 0 || self.is_pinned(id) {
            log::warn!(
                "INODE: Refusing to free inode {} (links={}, open={})",
                id,
                inode.links,
                self.pins.get(&id).copied().unwrap_or(0)
            );
            return Err(FsError::Busy);
        }

        let blocks = self.data_blocks(&inode)?;
        self.write_record(id, &InodeRecord::default())?;
        for block in blocks {
            self.alloc.free_block(&self.cache, block)?;
        }
        if let Some(indirect) = inode.blocks.indirect {
            self.alloc.free_block(&self.cache, indirect)?;
        }
        self.alloc.free_inode(&self.cache, id)?;

        log::debug!("INODE: Freed inode {}", id);
        Ok(())
    }

    /// Drop every link and free the inode
    pub(crate) fn discard(&mut self, id: InodeId) -> Result<()> {
        self.update(id, |inode| inode.links = 0)?;
        self.free(id)
    }

    /// Record an open handle on `id`
    pub fn pin(&mut self, id: InodeId) {
        *self.pins.entry(id).or_insert(0) += 1;
    }

    pub fn unpin(&mut self, id: InodeId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    pub fn is_pinned(&self, id: InodeId) -> bool {
        self.pins.contains_key(&id)
    }

    /// Inodes with at least one open handle
    pub fn pinned(&self) -> impl Iterator<Item = InodeId> + '_ {
        self.pins.keys().copied()
    }

    pub(crate) fn clear_pins(&mut self) {
        self.pins.clear();
    }

    fn read_pointers(&self, indirect: BlockId) -> Result<Vec<BlockId>> {
        let data = self.cache.read(indirect)?;
        let mut cursor = Cursor::new(&data[..]);
        let mut pointers = Vec::new();
        for _ in 0..self.layout.pointers_per_block() {
            let block = cursor.read_u32::<LittleEndian>()?;
            if block == 0 {
                break;
            }
            pointers.push(block as BlockId);
        }
        Ok(pointers)
    }

    fn write_pointers(&self, indirect: BlockId, pointers: &[BlockId]) -> Result<()> {
        let mut data = vec![0u8; self.block_size()];
        let mut cursor = Cursor::new(&mut data[..]);
        for &block in pointers {
            cursor.write_u32::<LittleEndian>(block as u32)?;
        }
        self.cache.write_block(indirect, &data)?;
        Ok(())
    }

    /// Content block ids in order: direct blocks, then those behind the indirect block
    pub fn data_blocks(&self, inode: &Inode) -> Result<Vec<BlockId>> {
        let mut blocks = inode.blocks.direct.clone();
        if let Some(indirect) = inode.blocks.indirect {
            blocks.extend(self.read_pointers(indirect)?);
        }
        Ok(blocks)
    }

    /// Read up to `len` bytes from `offset`; clamped to the inode size
    pub fn read_data(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset.saturating_add(len as u64));
        let bs = self.layout.block_size;
        let blocks = self.data_blocks(inode)?;

        // The block map must cover the range before anything is reserved
        if end.div_ceil(bs) > blocks.len() as u64 {
            return Err(FsError::Corrupt(format!(
                "inode {} has size {} but only {} blocks",
                inode.id,
                inode.size,
                blocks.len()
            )));
        }

        let mut result = Vec::with_capacity((end - offset) as usize);
        let mut current = offset;
        while current < end {
            let index = (current / bs) as usize;
            let block_offset = (current % bs) as usize;
            let block = *blocks.get(index).ok_or_else(|| {
                FsError::Corrupt(format!(
                    "inode {} has size {} but only {} blocks",
                    inode.id,
                    inode.size,
                    blocks.len()
                ))
            })?;

            let data = self.cache.read(block)?;
            let to_read = (bs as usize - block_offset).min((end - current) as usize);
            result.extend_from_slice(&data[block_offset..block_offset + to_read]);
            current += to_read as u64;
        }
        Ok(result)
    }

    /// Write `bytes` at `offset`, growing the inode as needed.
    ///
    /// `offset` may not lie past the current size. Either the whole write
    /// succeeds or the inode keeps its previous blocks and size.
    pub fn write_data(&mut self, id: InodeId, offset: u64, bytes: &[u8]) -> Result<usize> {
        let mut inode = self.get(id)?;
        if offset > inode.size {
            return Err(FsError::InvalidArgument(format!(
                "offset {} is past the end of inode {} (size {})",
                offset, id, inode.size
            )));
        }
        if bytes.is_empty() {
            return Ok(0);
        }

        let bs = self.layout.block_size;
        let end = offset + bytes.len() as u64;
        let needed = end.div_ceil(bs);
        if needed > self.layout.max_file_blocks() {
            log::warn!(
                "INODE: Write of {} bytes at {} exceeds the {}-block limit of inode {}",
                bytes.len(),
                offset,
                self.layout.max_file_blocks(),
                id
            );
            return Err(FsError::DiskFull);
        }

        let existing = self.data_blocks(&inode)?;
        let extra = needed.saturating_sub(existing.len() as u64);
        let new_indirect = needed > DIRECT_BLOCKS as u64 && inode.blocks.indirect.is_none();
        if extra + new_indirect as u64 > self.alloc.free_blocks() {
            log::warn!(
                "INODE: Write to inode {} needs {} blocks, {} free",
                id,
                extra + new_indirect as u64,
                self.alloc.free_blocks()
            );
            return Err(FsError::DiskFull);
        }

        let old_indirect = inode.blocks.indirect;
        let old_pointers = existing.get(DIRECT_BLOCKS..).map(<[BlockId]>::to_vec);
        let mut fresh = Vec::new();
        let result = self.grow_and_write(&mut inode, existing, extra, new_indirect, offset, bytes, &mut fresh);
        if let Err(e) = result {
            log::warn!("INODE: Write to inode {} failed ({}), rolling back", id, e);
            if let (Some(indirect), Some(pointers), true) = (old_indirect, old_pointers, extra > 0) {
                if let Err(undo) = self.write_pointers(indirect, &pointers) {
                    log::error!(
                        "INODE: Could not restore indirect block {} of inode {}: {}",
                        indirect,
                        id,
                        undo
                    );
                }
            }
            for block in fresh {
                if let Err(undo) = self.alloc.free_block(&self.cache, block) {
                    log::error!("INODE: Could not release block {} after failed write: {}", block, undo);
                }
            }
            return Err(e);
        }
        Ok(bytes.len())
    }

    #[allow(clippy::too_many_arguments)]
    fn grow_and_write(
        &mut self,
        inode: &mut Inode,
        mut blocks: Vec<BlockId>,
        extra: u64,
        new_indirect: bool,
        offset: u64,
        bytes: &[u8],
        fresh: &mut Vec<BlockId>,
    ) -> Result<()> {
        if new_indirect {
            let indirect = self.alloc.allocate_block(&self.cache)?;
            fresh.push(indirect);
            inode.blocks.indirect = Some(indirect);
        }
        for _ in 0..extra {
            let block = self.alloc.allocate_block(&self.cache)?;
            fresh.push(block);
            blocks.push(block);
        }

        let bs = self.layout.block_size;
        let mut current = offset;
        let mut written = 0;
        while written < bytes.len() {
            let index = (current / bs) as usize;
            let block_offset = (current % bs) as usize;
            let to_write = (bs as usize - block_offset).min(bytes.len() - written);
            let block = blocks[index];

            let mut data = if to_write == bs as usize || fresh.contains(&block) {
                vec![0u8; bs as usize]
            } else {
                self.cache.read(block)?
            };
            data[block_offset..block_offset + to_write]
                .copy_from_slice(&bytes[written..written + to_write]);
            self.cache.write_block(block, &data)?;

            written += to_write;
            current += to_write as u64;
        }

        // Map the new blocks only once their content is in place
        if extra > 0 {
            let split = blocks.len().min(DIRECT_BLOCKS);
            inode.blocks.direct = blocks[..split].to_vec();
            if let Some(indirect) = inode.blocks.indirect {
                self.write_pointers(indirect, &blocks[split..])?;
            }
        }

        inode.size = inode.size.max(current);
        inode.modified = chrono::Utc::now().timestamp();
        self.store(inode)
    }

    /// Shrink an inode to `new_size`, releasing blocks no longer covered
    pub fn truncate(&mut self, id: InodeId, new_size: u64) -> Result<()> {
        let mut inode = self.get(id)?;
        if new_size > inode.size {
            return Err(FsError::InvalidArgument(format!(
                "cannot grow inode {} by truncation",
                id
            )));
        }
        if new_size == inode.size {
            return Ok(());
        }

        let keep = new_size.div_ceil(self.layout.block_size) as usize;
        let blocks = self.data_blocks(&inode)?;
        let released: Vec<BlockId> = blocks[keep.min(blocks.len())..].to_vec();

        let split = keep.min(DIRECT_BLOCKS);
        inode.blocks.direct = blocks[..split].to_vec();
        let mut dropped_indirect = None;
        if let Some(indirect) = inode.blocks.indirect {
            if keep <= DIRECT_BLOCKS {
                dropped_indirect = Some(indirect);
                inode.blocks.indirect = None;
            } else if !released.is_empty() {
                self.write_pointers(indirect, &blocks[DIRECT_BLOCKS..keep])?;
            }
        }
        inode.size = new_size;
        inode.modified = chrono::Utc::now().timestamp();
        self.store(&inode)?;

        for block in released.into_iter().chain(dropped_indirect) {
            self.alloc.free_block(&self.cache, block)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("layout", &self.layout)
            .field("free_inodes", &self.alloc.free_inodes())
            .field("free_blocks", &self.alloc.free_blocks())
            .field("pinned", &self.pins.len())
            .finish()
    }
}
