//! tinyext on-disk format implementation
//!
//! Little-endian codecs for the superblock, inode records and directory entry
//! records, plus the format service that lays a fresh filesystem onto a disk.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use thiserror::Error;

use crate::alloc::Allocator;
use crate::blockdev::BlockDevice;
use crate::cache::BlockCache;
use crate::error::{FsError, Result};
use crate::inode::InodeTable;
use crate::layout::Layout;
use crate::perm::{Credentials, Mode};
use crate::{DIRECT_BLOCKS, MAX_NAME_LEN, ROOT_INODE};

/// Magic number for tinyext filesystem
pub const TINYEXT_MAGIC: &[u8; 8] = b"TINYEXT\x00";
/// Current filesystem version
pub const FS_VERSION: u32 = 1;
/// Size of one inode table slot in bytes
pub const INODE_SIZE: usize = 128;
/// Size of one directory entry record in bytes
pub const DIR_ENTRY_SIZE: usize = 64;

const VOLUME_NAME_LEN: usize = 32;
const SMALLEST_BLOCK: usize = 256;
const LARGEST_BLOCK: usize = 4096;

/// Error type for on-disk decoding
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported filesystem version: {0}")]
    UnsupportedVersion(u32),
    #[error("Superblock checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<FormatError> for FsError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Io(e) => FsError::from(e),
            other => FsError::Corrupt(other.to_string()),
        }
    }
}

/// Filesystem metadata stored in block 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number (TINYEXT\x00)
    pub magic: [u8; 8],
    /// Filesystem version
    pub version: u32,
    /// Block size in bytes
    pub block_size: u32,
    /// Number of blocks in the filesystem
    pub block_count: u64,
    /// Number of inode table slots
    pub inode_count: u64,
    /// Number of free blocks
    pub free_blocks: u64,
    /// Number of free inodes
    pub free_inodes: u64,
    /// Root inode number
    pub root_inode: u64,
    /// Direct block pointers per inode
    pub direct_blocks: u32,
    /// Format timestamp (seconds since the epoch)
    pub created: i64,
    /// Timestamp of last write
    pub last_write: i64,
    /// Filesystem UUID
    pub uuid: [u8; 16],
    /// Volume name
    pub volume_name: [u8; VOLUME_NAME_LEN],
}

impl Superblock {
    /// Encoded size in bytes, checksum included
    pub const SIZE: usize = 8 + 4 + 4 + 8 * 5 + 4 + 8 + 8 + 16 + VOLUME_NAME_LEN + 4;

    /// Create a superblock for a freshly formatted disk; counters start full
    pub fn new(options: &FormatOptions) -> Self {
        let mut uuid = [0u8; 16];
        if let Err(e) = getrandom::getrandom(&mut uuid) {
            log::warn!("FORMAT: No entropy for volume UUID ({}), using zeroes", e);
        }

        let mut volume_name = [0u8; VOLUME_NAME_LEN];
        if let Some(name) = &options.volume_name {
            let bytes = name.as_bytes();
            let len = bytes.len().min(VOLUME_NAME_LEN);
            volume_name[..len].copy_from_slice(&bytes[..len]);
        }

        let now = chrono::Utc::now().timestamp();
        Self {
            magic: *TINYEXT_MAGIC,
            version: FS_VERSION,
            block_size: options.block_size as u32,
            block_count: options.block_count,
            inode_count: options.inode_count,
            free_blocks: options.block_count,
            free_inodes: options.inode_count,
            root_inode: ROOT_INODE,
            direct_blocks: DIRECT_BLOCKS as u32,
            created: now,
            last_write: now,
            uuid,
            volume_name,
        }
    }

    /// Volume name with trailing NULs stripped
    pub fn volume_name(&self) -> String {
        String::from_utf8_lossy(&self.volume_name)
            .trim_end_matches('\0')
            .to_string()
    }

    fn encode_fields(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.block_size)?;
        buf.write_u64::<LittleEndian>(self.block_count)?;
        buf.write_u64::<LittleEndian>(self.inode_count)?;
        buf.write_u64::<LittleEndian>(self.free_blocks)?;
        buf.write_u64::<LittleEndian>(self.free_inodes)?;
        buf.write_u64::<LittleEndian>(self.root_inode)?;
        buf.write_u32::<LittleEndian>(self.direct_blocks)?;
        buf.write_i64::<LittleEndian>(self.created)?;
        buf.write_i64::<LittleEndian>(self.last_write)?;
        buf.write_all(&self.uuid)?;
        buf.write_all(&self.volume_name)?;
        Ok(buf)
    }

    /// Write the superblock (with trailing CRC32) to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let fields = self.encode_fields()?;
        writer.write_all(&fields)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&fields))?;
        Ok(())
    }

    /// Read a superblock from a reader, validating magic, version and checksum
    pub fn read_from<R: Read>(reader: &mut R) -> std::result::Result<Self, FormatError> {
        let mut raw = vec![0u8; Self::SIZE];
        reader.read_exact(&mut raw)?;

        let (fields, stored) = raw.split_at(Self::SIZE - 4);
        if &fields[..8] != TINYEXT_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let stored = Cursor::new(stored).read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(fields);
        if stored != computed {
            return Err(FormatError::ChecksumMismatch { stored, computed });
        }

        let mut cursor = Cursor::new(fields);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FS_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;
        let inode_count = cursor.read_u64::<LittleEndian>()?;
        let free_blocks = cursor.read_u64::<LittleEndian>()?;
        let free_inodes = cursor.read_u64::<LittleEndian>()?;
        let root_inode = cursor.read_u64::<LittleEndian>()?;
        let direct_blocks = cursor.read_u32::<LittleEndian>()?;
        let created = cursor.read_i64::<LittleEndian>()?;
        let last_write = cursor.read_i64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;

        let mut volume_name = [0u8; VOLUME_NAME_LEN];
        cursor.read_exact(&mut volume_name)?;

        Ok(Self {
            magic,
            version,
            block_size,
            block_count,
            inode_count,
            free_blocks,
            free_inodes,
            root_inode,
            direct_blocks,
            created,
            last_write,
            uuid,
            volume_name,
        })
    }

    /// Persist the superblock into block 0
    pub fn store(&self, cache: &BlockCache) -> Result<()> {
        let mut block = vec![0u8; cache.block_size()];
        self.write_to(&mut Cursor::new(&mut block[..]))?;
        cache.write_block(0, &block)?;
        Ok(())
    }

    /// Load the superblock from block 0
    pub fn load(cache: &BlockCache) -> Result<Self> {
        let block = cache.read(0)?;
        Ok(Self::read_from(&mut Cursor::new(&block[..]))?)
    }

    /// Read the superblock straight from the start of an image file,
    /// before the block size is known
    pub fn probe(path: &std::path::Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Ok(Self::read_from(&mut file)?)
    }
}

/// Raw on-disk inode slot (exactly [`INODE_SIZE`] bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeRecord {
    /// 0 = free slot, 1 = regular file, 2 = directory
    pub kind: u8,
    /// Permission bits
    pub mode: u16,
    /// User ID of owner
    pub uid: u32,
    /// Group ID of owner
    pub gid: u32,
    /// Number of directory entries naming this inode
    pub links: u16,
    /// Size in bytes
    pub size: u64,
    /// Creation time
    pub created: i64,
    /// Last modification time
    pub modified: i64,
    /// Direct block pointers (0 = unused)
    pub direct: [u32; DIRECT_BLOCKS],
    /// Single indirect block pointer (0 = none)
    pub indirect: u32,
}

impl InodeRecord {
    pub fn is_free(&self) -> bool {
        self.kind == 0
    }

    /// Write the record into exactly `INODE_SIZE` bytes
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buffer = [0u8; INODE_SIZE];
        let mut cursor = Cursor::new(&mut buffer[..]);

        cursor.write_u8(self.kind)?;
        cursor.write_u8(0)?;
        cursor.write_u16::<LittleEndian>(self.mode)?;
        cursor.write_u32::<LittleEndian>(self.uid)?;
        cursor.write_u32::<LittleEndian>(self.gid)?;
        cursor.write_u16::<LittleEndian>(self.links)?;
        cursor.write_u16::<LittleEndian>(0)?;
        cursor.write_u64::<LittleEndian>(self.size)?;
        cursor.write_i64::<LittleEndian>(self.created)?;
        cursor.write_i64::<LittleEndian>(self.modified)?;
        for &block in &self.direct {
            cursor.write_u32::<LittleEndian>(block)?;
        }
        cursor.write_u32::<LittleEndian>(self.indirect)?;

        writer.write_all(&buffer)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let kind = reader.read_u8()?;
        let _pad = reader.read_u8()?;
        let mode = reader.read_u16::<LittleEndian>()?;
        let uid = reader.read_u32::<LittleEndian>()?;
        let gid = reader.read_u32::<LittleEndian>()?;
        let links = reader.read_u16::<LittleEndian>()?;
        let _pad = reader.read_u16::<LittleEndian>()?;
        let size = reader.read_u64::<LittleEndian>()?;
        let created = reader.read_i64::<LittleEndian>()?;
        let modified = reader.read_i64::<LittleEndian>()?;
        let mut direct = [0u32; DIRECT_BLOCKS];
        for slot in direct.iter_mut() {
            *slot = reader.read_u32::<LittleEndian>()?;
        }
        let indirect = reader.read_u32::<LittleEndian>()?;

        Ok(Self {
            kind,
            mode,
            uid,
            gid,
            links,
            size,
            created,
            modified,
            direct,
            indirect,
        })
    }
}

/// Directory entry record (exactly [`DIR_ENTRY_SIZE`] bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRecord {
    /// Inode number
    pub inode: u32,
    /// Kind code of the target (same encoding as [`InodeRecord::kind`])
    pub kind: u8,
    /// Entry name, at most [`MAX_NAME_LEN`] bytes
    pub name: String,
}

impl DirEntryRecord {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry name length {} out of bounds", name.len()),
            ));
        }

        let mut buffer = [0u8; DIR_ENTRY_SIZE];
        let mut cursor = Cursor::new(&mut buffer[..]);
        cursor.write_u32::<LittleEndian>(self.inode)?;
        cursor.write_u8(self.kind)?;
        cursor.write_u8(name.len() as u8)?;
        cursor.write_u16::<LittleEndian>(0)?;
        cursor.write_all(name)?;

        writer.write_all(&buffer)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> std::result::Result<Self, FormatError> {
        let inode = reader.read_u32::<LittleEndian>()?;
        let kind = reader.read_u8()?;
        let name_len = reader.read_u8()? as usize;
        let _reserved = reader.read_u16::<LittleEndian>()?;
        let mut name = [0u8; MAX_NAME_LEN];
        reader.read_exact(&mut name)?;

        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(FormatError::InvalidRecord(format!(
                "directory entry name length {}",
                name_len
            )));
        }
        let name = std::str::from_utf8(&name[..name_len])
            .map_err(|_| FormatError::InvalidRecord("directory entry name is not UTF-8".into()))?
            .to_string();

        Ok(Self { inode, kind, name })
    }
}

/// Geometry chosen at format time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// Block size in bytes
    pub block_size: usize,
    /// Total blocks on the disk
    pub block_count: u64,
    /// Inode table slots, including reserved slot 0
    pub inode_count: u64,
    /// Optional volume label (truncated to 32 bytes)
    pub volume_name: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::with_geometry(crate::blockdev::DEFAULT_BLOCK_SIZE, 1024)
    }
}

impl FormatOptions {
    /// Options for the given geometry with one inode per eight blocks
    pub fn with_geometry(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            inode_count: (block_count / 8).max(16),
            volume_name: None,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.block_size as u64, self.block_count, self.inode_count)
    }

    /// Check the geometry against the limits of the on-disk format
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(SMALLEST_BLOCK..=LARGEST_BLOCK).contains(&self.block_size)
        {
            return Err(FsError::InvalidArgument(format!(
                "block size {} must be a power of two between {} and {}",
                self.block_size, SMALLEST_BLOCK, LARGEST_BLOCK
            )));
        }
        if self.block_count > u32::MAX as u64 || self.inode_count > u32::MAX as u64 {
            return Err(FsError::InvalidArgument(
                "block and inode counts must fit in 32 bits".into(),
            ));
        }
        if self.inode_count < 2 {
            return Err(FsError::InvalidArgument(format!(
                "inode count {} leaves no room for the root directory",
                self.inode_count
            )));
        }
        let layout = self.layout();
        if layout.data_blocks_count < 2 {
            return Err(FsError::InvalidArgument(format!(
                "{} blocks cannot hold {} metadata blocks plus data",
                self.block_count,
                layout.metadata_blocks()
            )));
        }
        Ok(())
    }
}

/// Lay a fresh, empty filesystem onto `device`, destroying prior content.
///
/// Resets both bitmaps (keeping only metadata blocks and inode slot 0
/// reserved), zeroes the inode table, and creates the root directory at
/// [`ROOT_INODE`] with `.` and `..` naming itself.
pub fn format(
    device: Arc<dyn BlockDevice>,
    options: &FormatOptions,
    cache_blocks: usize,
) -> Result<InodeTable> {
    options.validate()?;
    if device.block_size() != options.block_size {
        return Err(FsError::InvalidArgument(format!(
            "device block size {} does not match requested {}",
            device.block_size(),
            options.block_size
        )));
    }
    if device.block_count() < options.block_count {
        return Err(FsError::InvalidArgument(format!(
            "device holds {} blocks, {} requested",
            device.block_count(),
            options.block_count
        )));
    }
    if device.is_read_only() {
        return Err(FsError::InvalidArgument("device is read-only".into()));
    }

    let layout = options.layout();
    log::info!(
        "FORMAT: block_size={}, block_count={}, inode_count={}, data_start={}",
        layout.block_size,
        layout.block_count,
        layout.inode_count,
        layout.data_blocks
    );

    let cache = BlockCache::new(device, cache_blocks);
    for block in layout.inode_table..layout.inode_table + layout.inode_table_blocks {
        cache.zero_block(block)?;
    }

    let superblock = Superblock::new(options);
    let alloc = Allocator::format(&cache, layout, superblock)?;
    let mut table = InodeTable::new(cache, layout, alloc);

    let root = table.allocate(
        crate::inode::InodeKind::Directory,
        Mode::DEFAULT_DIR,
        &Credentials::ROOT,
    )?;
    if root != ROOT_INODE {
        return Err(FsError::Corrupt(format!(
            "root directory landed in inode {} instead of {}",
            root, ROOT_INODE
        )));
    }
    table.init_root()?;
    table.cache().sync()?;

    log::info!(
        "FORMAT: Done - {} free blocks, {} free inodes",
        table.allocator().free_blocks(),
        table.allocator().free_inodes()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let options = FormatOptions {
            volume_name: Some("testvol".into()),
            ..FormatOptions::default()
        };
        let sb = Superblock::new(&options);

        let mut buffer = Cursor::new(Vec::new());
        sb.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.get_ref().len(), Superblock::SIZE);

        buffer.set_position(0);
        let sb2 = Superblock::read_from(&mut buffer).unwrap();
        assert_eq!(sb, sb2);
        assert_eq!(sb2.volume_name(), "testvol");
        assert_eq!(sb2.root_inode, ROOT_INODE);
    }

    #[test]
    fn test_superblock_detects_corruption() {
        let sb = Superblock::new(&FormatOptions::default());
        let mut buffer = Vec::new();
        sb.write_to(&mut buffer).unwrap();

        // Flip a bit in the inode count
        buffer[30] ^= 0x01;
        let result = Superblock::read_from(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(FormatError::ChecksumMismatch { .. })));

        buffer[0] = b'X';
        let result = Superblock::read_from(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(FormatError::InvalidMagic)));
    }

    #[test]
    fn test_inode_record_is_fixed_size() {
        let mut record = InodeRecord {
            kind: 1,
            mode: 0o644,
            uid: 1000,
            gid: 100,
            links: 1,
            size: 2000,
            ..Default::default()
        };
        record.direct[0] = 40;
        record.direct[3] = 43;
        record.indirect = 99;

        let mut buffer = Vec::new();
        record.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len(), INODE_SIZE);

        let decoded = InodeRecord::read_from(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_dir_entry_name_bounds() {
        let long = DirEntryRecord {
            inode: 3,
            kind: 1,
            name: "x".repeat(MAX_NAME_LEN + 1),
        };
        assert!(long.write_to(&mut Vec::new()).is_err());

        let fits = DirEntryRecord {
            inode: 3,
            kind: 1,
            name: "y".repeat(MAX_NAME_LEN),
        };
        let mut buffer = Vec::new();
        fits.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len(), DIR_ENTRY_SIZE);
        let decoded = DirEntryRecord::read_from(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(decoded, fits);
    }

    #[test]
    fn test_empty_entry_is_rejected() {
        let buffer = [0u8; DIR_ENTRY_SIZE];
        let result = DirEntryRecord::read_from(&mut Cursor::new(&buffer[..]));
        assert!(matches!(result, Err(FormatError::InvalidRecord(_))));
    }

    #[test]
    fn test_options_validation() {
        assert!(FormatOptions::default().validate().is_ok());
        assert!(FormatOptions::with_geometry(500, 1024).validate().is_err());
        assert!(FormatOptions::with_geometry(8192, 1024).validate().is_err());
        assert!(FormatOptions::with_geometry(512, 10).validate().is_err());

        let mut options = FormatOptions::default();
        options.inode_count = 1;
        assert!(matches!(options.validate(), Err(FsError::InvalidArgument(_))));
    }
}
