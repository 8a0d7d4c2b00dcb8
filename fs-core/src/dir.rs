//! Directory management for tinyext
//!
//! A directory's content is a packed array of fixed-size entry records.
//! Records stay in insertion order; removing one compacts the array and
//! shrinks the directory. Every directory starts with `.` and `..`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::error::{FsError, Result};
use crate::format::{DirEntryRecord, DIR_ENTRY_SIZE};
use crate::inode::{Inode, InodeId, InodeKind, InodeTable};
use crate::perm::{Credentials, Mode};
use crate::{MAX_NAME_LEN, ROOT_INODE};

/// Name of the self entry
pub const DOT: &str = ".";
/// Name of the parent entry
pub const DOT_DOT: &str = "..";

/// A validated directory entry name
///
/// Non-empty, at most [`MAX_NAME_LEN`] bytes, no `/` or NUL, and not one of
/// the reserved names `.` and `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileName(String);

impl FileName {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(FsError::InvalidName("empty name".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidName(format!(
                "'{}' is longer than {} bytes",
                name, MAX_NAME_LEN
            )));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(FsError::InvalidName(format!("'{}' contains '/' or NUL", name)));
        }
        if name == DOT || name == DOT_DOT {
            return Err(FsError::InvalidName(format!("'{}' is reserved", name)));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for FileName {
    type Error = FsError;

    fn try_from(name: &str) -> Result<Self> {
        Self::new(name)
    }
}

/// One name → inode binding inside a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeId,
    pub kind: InodeKind,
}

impl DirEntry {
    /// Whether this is the `.` or `..` entry
    pub fn is_special(&self) -> bool {
        self.name == DOT || self.name == DOT_DOT
    }
}

fn encode_entry(name: &str, inode: InodeId, kind: InodeKind) -> Result<Vec<u8>> {
    let record = DirEntryRecord {
        inode: inode as u32,
        kind: kind.code(),
        name: name.to_string(),
    };
    let mut buf = Vec::with_capacity(DIR_ENTRY_SIZE);
    record.write_to(&mut buf)?;
    Ok(buf)
}

impl InodeTable {
    fn read_entries(&self, dir: &Inode) -> Result<Vec<DirEntry>> {
        let content = self.read_data(dir, 0, dir.size as usize)?;
        if content.len() % DIR_ENTRY_SIZE != 0 {
            return Err(FsError::Corrupt(format!(
                "directory {} has size {} (not a multiple of {})",
                dir.id, dir.size, DIR_ENTRY_SIZE
            )));
        }

        content
            .chunks(DIR_ENTRY_SIZE)
            .map(|chunk| {
                let record = DirEntryRecord::read_from(&mut Cursor::new(chunk))?;
                let kind = InodeKind::from_code(record.kind).ok_or_else(|| {
                    FsError::Corrupt(format!(
                        "entry '{}' in directory {} has kind code {}",
                        record.name, dir.id, record.kind
                    ))
                })?;
                Ok(DirEntry {
                    name: record.name,
                    inode: record.inode as InodeId,
                    kind,
                })
            })
            .collect()
    }

    fn directory(&self, id: InodeId) -> Result<Inode> {
        let inode = self.get(id)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    /// Entries of a directory in insertion order, `.` and `..` first
    pub fn list_entries(&self, dir: InodeId) -> Result<Vec<DirEntry>> {
        let inode = self.directory(dir)?;
        self.read_entries(&inode)
    }

    /// Find `name` inside `dir`
    pub fn lookup(&self, dir: InodeId, name: &str) -> Result<DirEntry> {
        self.list_entries(dir)?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or(FsError::NotFound)
    }

    /// Whether a directory holds nothing but `.` and `..`
    pub fn is_empty_dir(&self, dir: &Inode) -> Result<bool> {
        Ok(self.read_entries(dir)?.iter().all(DirEntry::is_special))
    }

    /// Append `name → child` to `parent` and count the new link on `child`
    pub fn add_entry(
        &mut self,
        parent: InodeId,
        name: &FileName,
        child: InodeId,
        kind: InodeKind,
    ) -> Result<()> {
        let dir = self.directory(parent)?;
        if self.read_entries(&dir)?.iter().any(|e| e.name == name.as_str()) {
            return Err(FsError::DuplicateName);
        }
        let target = self.get(child)?;
        if target.links == u16::MAX {
            return Err(FsError::InvalidArgument(format!(
                "inode {} has too many links",
                child
            )));
        }

        let record = encode_entry(name.as_str(), child, kind)?;
        self.write_data(parent, dir.size, &record)?;
        if let Err(e) = self.update(child, |inode| inode.links += 1) {
            if let Err(undo) = self.truncate(parent, dir.size) {
                log::error!(
                    "DIR: Could not drop entry '{}' from directory {}: {}",
                    name,
                    parent,
                    undo
                );
            }
            return Err(e);
        }

        log::debug!("DIR: Added '{}' -> inode {} in directory {}", name, child, parent);
        Ok(())
    }

    /// Unlink `name` from `parent`, freeing the target when its last link goes.
    ///
    /// Directories must be empty. Removing a directory also drops the link its
    /// `..` held on `parent`.
    pub fn remove_entry(&mut self, parent: InodeId, name: &str) -> Result<()> {
        if name == DOT || name == DOT_DOT {
            return Err(FsError::InvalidArgument(format!("cannot remove '{}'", name)));
        }

        let dir = self.directory(parent)?;
        let mut entries = self.read_entries(&dir)?;
        let position = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(FsError::NotFound)?;
        let entry = entries.remove(position);
        let target = self.get(entry.inode)?;

        let dropped = if target.is_dir() {
            if !self.is_empty_dir(&target)? {
                return Err(FsError::NotEmpty);
            }
            // The entry in `parent` plus the directory's own `.`
            2
        } else {
            1
        };
        let remaining = target.links.saturating_sub(dropped);
        if remaining == 0 && self.is_pinned(target.id) {
            log::warn!("DIR: '{}' (inode {}) is open, not removing", name, target.id);
            return Err(FsError::Busy);
        }

        let mut content = Vec::with_capacity(entries.len() * DIR_ENTRY_SIZE);
        for e in &entries {
            content.extend(encode_entry(&e.name, e.inode, e.kind)?);
        }
        self.write_data(parent, 0, &content)?;
        self.truncate(parent, content.len() as u64)?;

        if target.is_dir() {
            self.update(parent, |inode| inode.links = inode.links.saturating_sub(1))?;
        }
        self.update(target.id, |inode| inode.links = remaining)?;
        if remaining == 0 {
            self.free(target.id)?;
        }

        log::debug!("DIR: Removed '{}' (inode {}) from directory {}", name, target.id, parent);
        Ok(())
    }

    /// Create an empty directory `name` inside `parent`
    pub fn create_directory(
        &mut self,
        parent: InodeId,
        name: &FileName,
        mode: Mode,
        owner: &Credentials,
    ) -> Result<InodeId> {
        let dir = self.directory(parent)?;
        if self.read_entries(&dir)?.iter().any(|e| e.name == name.as_str()) {
            return Err(FsError::DuplicateName);
        }

        let id = self.allocate(InodeKind::Directory, mode, owner)?;
        let result = self.init_directory(id, parent).and_then(|()| {
            self.add_entry(parent, name, id, InodeKind::Directory)?;
            self.update(parent, |inode| inode.links += 1)
        });
        if let Err(e) = result {
            self.rollback_create(id);
            return Err(e);
        }

        log::info!("DIR: Created directory '{}' (inode {}) in {}", name, id, parent);
        Ok(id)
    }

    fn rollback_create(&mut self, id: InodeId) {
        if let Err(undo) = self.discard(id) {
            log::error!("DIR: Could not release inode {} after failed create: {}", id, undo);
        }
    }

    /// Create an empty regular file `name` inside `parent`
    pub fn create_file(
        &mut self,
        parent: InodeId,
        name: &FileName,
        mode: Mode,
        owner: &Credentials,
    ) -> Result<InodeId> {
        let dir = self.directory(parent)?;
        if self.read_entries(&dir)?.iter().any(|e| e.name == name.as_str()) {
            return Err(FsError::DuplicateName);
        }

        let id = self.allocate(InodeKind::File, mode, owner)?;
        if let Err(e) = self.add_entry(parent, name, id, InodeKind::File) {
            self.rollback_create(id);
            return Err(e);
        }

        log::info!("DIR: Created file '{}' (inode {}) in {}", name, id, parent);
        Ok(id)
    }

    /// Write `.` and `..` into a fresh directory; its `.` is its first link
    fn init_directory(&mut self, id: InodeId, parent: InodeId) -> Result<()> {
        let mut content = encode_entry(DOT, id, InodeKind::Directory)?;
        content.extend(encode_entry(DOT_DOT, parent, InodeKind::Directory)?);
        self.write_data(id, 0, &content)?;
        let self_link = if id == parent { 2 } else { 1 };
        self.update(id, |inode| inode.links = self_link)
    }

    /// Populate the root directory; both of its special entries name itself
    pub(crate) fn init_root(&mut self) -> Result<()> {
        self.init_directory(ROOT_INODE, ROOT_INODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::format::{format, FormatOptions};
    use std::sync::Arc;

    fn table() -> InodeTable {
        let options = FormatOptions::default();
        let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
        format(device, &options, 16).unwrap()
    }

    fn name(s: &str) -> FileName {
        FileName::new(s).unwrap()
    }

    #[test]
    fn test_file_name_validation() {
        assert!(FileName::new("notes.txt").is_ok());
        assert!(FileName::new(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert!(matches!(
            FileName::new(&"a".repeat(MAX_NAME_LEN + 1)),
            Err(FsError::InvalidName(_))
        ));
        assert!(FileName::new("").is_err());
        assert!(FileName::new("a/b").is_err());
        assert!(FileName::new(".").is_err());
        assert!(FileName::new("..").is_err());
    }

    #[test]
    fn test_root_after_format() {
        let table = table();
        let entries = table.list_entries(ROOT_INODE).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[0].inode, ROOT_INODE);
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].inode, ROOT_INODE);
        assert_eq!(table.get(ROOT_INODE).unwrap().links, 2);
    }

    #[test]
    fn test_create_directory_links() {
        let mut table = table();
        let a = table
            .create_directory(ROOT_INODE, &name("a"), Mode::DEFAULT_DIR, &Credentials::ROOT)
            .unwrap();

        assert_eq!(table.get(a).unwrap().links, 2);
        assert_eq!(table.get(ROOT_INODE).unwrap().links, 3);
        assert_eq!(table.lookup(a, "..").unwrap().inode, ROOT_INODE);
        assert_eq!(table.lookup(a, ".").unwrap().inode, a);
        assert_eq!(table.lookup(ROOT_INODE, "a").unwrap().kind, InodeKind::Directory);
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let mut table = table();
        for n in ["zeta", "alpha", "mid"] {
            table
                .create_file(ROOT_INODE, &name(n), Mode::DEFAULT_FILE, &Credentials::ROOT)
                .unwrap();
        }
        let names: Vec<_> = table
            .list_entries(ROOT_INODE)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "zeta", "alpha", "mid"]);

        table.remove_entry(ROOT_INODE, "alpha").unwrap();
        let names: Vec<_> = table
            .list_entries(ROOT_INODE)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "zeta", "mid"]);
    }

    #[test]
    fn test_duplicate_name_leaves_state() {
        let mut table = table();
        table
            .create_file(ROOT_INODE, &name("f"), Mode::DEFAULT_FILE, &Credentials::ROOT)
            .unwrap();
        let entries = table.list_entries(ROOT_INODE).unwrap();
        let free_blocks = table.allocator().free_blocks();
        let free_inodes = table.allocator().free_inodes();

        let result = table.create_file(ROOT_INODE, &name("f"), Mode::DEFAULT_FILE, &Credentials::ROOT);
        assert!(matches!(result, Err(FsError::DuplicateName)));
        let result =
            table.create_directory(ROOT_INODE, &name("f"), Mode::DEFAULT_DIR, &Credentials::ROOT);
        assert!(matches!(result, Err(FsError::DuplicateName)));

        assert_eq!(table.list_entries(ROOT_INODE).unwrap(), entries);
        assert_eq!(table.allocator().free_blocks(), free_blocks);
        assert_eq!(table.allocator().free_inodes(), free_inodes);
    }

    #[test]
    fn test_not_a_directory() {
        let mut table = table();
        let f = table
            .create_file(ROOT_INODE, &name("f"), Mode::DEFAULT_FILE, &Credentials::ROOT)
            .unwrap();
        assert!(matches!(table.list_entries(f), Err(FsError::NotADirectory)));
        let result = table.add_entry(f, &name("x"), ROOT_INODE, InodeKind::Directory);
        assert!(matches!(result, Err(FsError::NotADirectory)));
    }

    #[test]
    fn test_remove_non_empty_directory() {
        let mut table = table();
        let a = table
            .create_directory(ROOT_INODE, &name("a"), Mode::DEFAULT_DIR, &Credentials::ROOT)
            .unwrap();
        table
            .create_file(a, &name("f"), Mode::DEFAULT_FILE, &Credentials::ROOT)
            .unwrap();

        assert!(matches!(table.remove_entry(ROOT_INODE, "a"), Err(FsError::NotEmpty)));
        assert!(table.lookup(a, "f").is_ok());
        assert!(matches!(table.remove_entry(ROOT_INODE, "nope"), Err(FsError::NotFound)));
        assert!(matches!(
            table.remove_entry(ROOT_INODE, ".."),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_restores_counts() {
        let mut table = table();
        let free_blocks = table.allocator().free_blocks();
        let free_inodes = table.allocator().free_inodes();

        table
            .create_directory(ROOT_INODE, &name("d"), Mode::DEFAULT_DIR, &Credentials::ROOT)
            .unwrap();
        table.remove_entry(ROOT_INODE, "d").unwrap();

        assert_eq!(table.allocator().free_blocks(), free_blocks);
        assert_eq!(table.allocator().free_inodes(), free_inodes);
        assert_eq!(table.get(ROOT_INODE).unwrap().links, 2);
        assert_eq!(table.get(ROOT_INODE).unwrap().size, 2 * DIR_ENTRY_SIZE as u64);
    }

    #[test]
    fn test_remove_open_file_is_busy() {
        let mut table = table();
        let f = table
            .create_file(ROOT_INODE, &name("f"), Mode::DEFAULT_FILE, &Credentials::ROOT)
            .unwrap();
        table.pin(f);

        assert!(matches!(table.remove_entry(ROOT_INODE, "f"), Err(FsError::Busy)));
        assert_eq!(table.get(f).unwrap().links, 1);

        table.unpin(f);
        table.remove_entry(ROOT_INODE, "f").unwrap();
        assert!(matches!(table.get(f), Err(FsError::NotFound)));
    }

    #[test]
    fn test_directory_grows_past_one_block() {
        let mut table = table();
        let per_block = table.block_size() / DIR_ENTRY_SIZE;
        for i in 0..per_block * 2 {
            table
                .create_file(ROOT_INODE, &name(&format!("f{}", i)), Mode::DEFAULT_FILE, &Credentials::ROOT)
                .unwrap();
        }
        let root = table.get(ROOT_INODE).unwrap();
        assert_eq!(root.blocks.direct.len(), 3);
        assert_eq!(table.list_entries(ROOT_INODE).unwrap().len(), per_block * 2 + 2);

        for i in 0..per_block * 2 {
            table.remove_entry(ROOT_INODE, &format!("f{}", i)).unwrap();
        }
        assert_eq!(table.get(ROOT_INODE).unwrap().blocks.direct.len(), 1);
    }
}
