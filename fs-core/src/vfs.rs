//! Filesystem facade
//!
//! [`FileSystem`] ties the inode table, directory tree, path resolver and
//! open-file table together behind the operations a shell issues. Every
//! operation takes the caller's [`Session`]; the engine keeps no notion of a
//! current user or directory of its own.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::blockdev::BlockDevice;
use crate::cache::BlockCache;
use crate::check::{CheckReport, ConsistencyChecker};
use crate::config::{FsConfig, RemovePolicy};
use crate::dir::DirEntry;
use crate::error::{FsError, Result};
use crate::format::{self, FormatOptions};
use crate::handle::{HandleId, OpenFileTable};
use crate::inode::{Inode, InodeId, InodeKind, InodeTable};
use crate::path::{ParentRef, PathResolver, Resolved};
use crate::perm::{check_owner, Access, Credentials, Mode};
use crate::session::{Session, SessionId};

/// Volume-wide usage figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub volume_name: String,
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Blocks taken by the superblock, bitmaps and inode table
    pub metadata_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// A mounted tinyext filesystem
pub struct FileSystem {
    inodes: InodeTable,
    handles: OpenFileTable,
    config: FsConfig,
    next_session: u64,
}

impl FileSystem {
    fn with_table(inodes: InodeTable, config: FsConfig) -> Self {
        Self {
            inodes,
            handles: OpenFileTable::new(),
            config,
            next_session: 1,
        }
    }

    /// Format `device` and mount the fresh filesystem
    pub fn format(
        device: Arc<dyn BlockDevice>,
        options: &FormatOptions,
        config: FsConfig,
    ) -> Result<Self> {
        let inodes = format::format(device, options, config.cache_blocks)?;
        Ok(Self::with_table(inodes, config))
    }

    /// Mount an already formatted device
    pub fn mount(device: Arc<dyn BlockDevice>, config: FsConfig) -> Result<Self> {
        let inodes = InodeTable::mount(BlockCache::new(device, config.cache_blocks))?;
        Ok(Self::with_table(inodes, config))
    }

    /// Start a session for an authenticated user, positioned at the root
    pub fn open_session(&mut self, user: &str, creds: Credentials) -> Session {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        log::info!("VFS: {} opened for '{}' (uid {})", id, user, creds.uid);
        Session::new(id, user, creds)
    }

    /// End a session, closing any handles it left open
    pub fn end_session(&mut self, session: &Session) -> usize {
        self.handles.close_session(&mut self.inodes, session.id)
    }

    fn resolve(&self, session: &Session, path: &str) -> Result<Resolved> {
        PathResolver::new(&self.inodes).resolve(&session.cwd, path)
    }

    fn resolve_parent(&self, session: &Session, path: &str) -> Result<ParentRef> {
        PathResolver::new(&self.inodes).resolve_parent(&session.cwd, path)
    }

    /// Move the session to `path`; the session is untouched on failure
    pub fn change_directory(&self, session: &mut Session, path: &str) -> Result<()> {
        let resolved = self.resolve(session, path)?;
        if resolved.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        session.cwd = resolved.path;
        Ok(())
    }

    pub fn make_directory(&mut self, session: &Session, path: &str, mode: Mode) -> Result<InodeId> {
        let target = self.resolve_parent(session, path)?;
        self.inodes
            .create_directory(target.parent, &target.name, mode, &session.creds)
    }

    pub fn create_file(&mut self, session: &Session, path: &str, mode: Mode) -> Result<InodeId> {
        let target = self.resolve_parent(session, path)?;
        self.inodes
            .create_file(target.parent, &target.name, mode, &session.creds)
    }

    /// Resolve a removal target and refuse anything the session is standing in
    fn removal_target(&self, session: &Session, path: &str) -> Result<(ParentRef, Inode)> {
        let target = self.resolve_parent(session, path)?;
        let entry = self.inodes.lookup(target.parent, target.name.as_str())?;
        let inode = self.inodes.get(entry.inode)?;

        if inode.is_dir() {
            let mut full = target.parent_path.clone();
            full.push(target.name.clone());
            if session.cwd.starts_with(&full) {
                return Err(FsError::InvalidArgument(format!(
                    "'{}' contains the current directory",
                    path
                )));
            }
        }
        if self.config.ownership.enforce_remove {
            check_owner(&inode, &session.creds)?;
        }
        Ok((target, inode))
    }

    /// Remove an empty directory
    pub fn remove_directory(&mut self, session: &Session, path: &str) -> Result<()> {
        let (target, inode) = self.removal_target(session, path)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        self.inodes.remove_entry(target.parent, target.name.as_str())
    }

    /// Remove a file, or a directory according to the configured [`RemovePolicy`]
    pub fn remove(&mut self, session: &Session, path: &str) -> Result<()> {
        let (target, inode) = self.removal_target(session, path)?;
        if !inode.is_dir() || self.config.remove_directories == RemovePolicy::RequireEmpty {
            return self.inodes.remove_entry(target.parent, target.name.as_str());
        }

        // Validate the whole subtree before unlinking anything
        let mut doomed = Vec::new();
        self.collect_subtree(&inode, &session.creds, &mut doomed)?;
        for (parent, name) in doomed {
            self.inodes.remove_entry(parent, &name)?;
        }
        self.inodes.remove_entry(target.parent, target.name.as_str())?;

        log::info!("VFS: Recursively removed '{}'", path);
        Ok(())
    }

    /// Post-order list of (parent, name) pairs below `dir`
    fn collect_subtree(
        &self,
        dir: &Inode,
        creds: &Credentials,
        out: &mut Vec<(InodeId, String)>,
    ) -> Result<()> {
        for entry in self.inodes.list_entries(dir.id)? {
            if entry.is_special() {
                continue;
            }
            let child = self.inodes.get(entry.inode)?;
            if self.inodes.is_pinned(child.id) {
                log::warn!("VFS: '{}' (inode {}) is open", entry.name, child.id);
                return Err(FsError::Busy);
            }
            if self.config.ownership.enforce_remove {
                check_owner(&child, creds)?;
            }
            if child.is_dir() {
                self.collect_subtree(&child, creds, out)?;
            }
            out.push((dir.id, entry.name));
        }
        Ok(())
    }

    pub fn open_file(&mut self, session: &Session, path: &str, access: Access) -> Result<HandleId> {
        self.handles.open(&mut self.inodes, session, path, access)
    }

    pub fn close_file(&mut self, session: &Session, handle: HandleId) -> Result<()> {
        self.handles.close(&mut self.inodes, session, handle)
    }

    /// Close every handle the session holds on the file at `path`
    pub fn close_path(&mut self, session: &Session, path: &str) -> Result<usize> {
        let resolved = self.resolve(session, path)?;
        self.handles
            .close_inode(&mut self.inodes, session, resolved.inode)
    }

    pub fn read_file(&mut self, session: &Session, handle: HandleId, len: usize) -> Result<Vec<u8>> {
        self.handles.read(&self.inodes, session, handle, len)
    }

    pub fn write_file(&mut self, session: &Session, handle: HandleId, bytes: &[u8]) -> Result<usize> {
        self.handles.write(&mut self.inodes, session, handle, bytes)
    }

    pub fn seek(&mut self, session: &Session, handle: HandleId, offset: u64) -> Result<()> {
        self.handles.seek(&self.inodes, session, handle, offset)
    }

    /// Entries of the session's working directory
    pub fn list(&self, session: &Session) -> Result<Vec<DirEntry>> {
        self.list_path(session, ".")
    }

    /// Entries of a directory, or the single entry for a file
    pub fn list_path(&self, session: &Session, path: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(session, path)?;
        match resolved.kind {
            InodeKind::Directory => self.inodes.list_entries(resolved.inode),
            InodeKind::File => {
                let name = resolved
                    .path
                    .last()
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                Ok(vec![DirEntry {
                    name,
                    inode: resolved.inode,
                    kind: resolved.kind,
                }])
            }
        }
    }

    pub fn stat(&self, session: &Session, path: &str) -> Result<Inode> {
        let resolved = self.resolve(session, path)?;
        self.inodes.get(resolved.inode)
    }

    /// Overwrite the mode of the inode at `path`
    pub fn set_mode(&mut self, session: &Session, path: &str, mode: Mode) -> Result<()> {
        let resolved = self.resolve(session, path)?;
        if self.config.ownership.enforce_chmod {
            check_owner(&self.inodes.get(resolved.inode)?, &session.creds)?;
        }
        self.inodes.update(resolved.inode, |inode| {
            inode.mode = mode;
            inode.modified = chrono::Utc::now().timestamp();
        })
    }

    /// Wipe the disk, keeping its geometry and volume name.
    ///
    /// All open handles are dropped and the session returns to the root.
    pub fn format_disk(&mut self, session: &mut Session) -> Result<()> {
        let layout = *self.inodes.layout();
        let superblock = self.inodes.allocator().superblock();
        let options = FormatOptions {
            block_size: layout.block_size as usize,
            block_count: layout.block_count,
            inode_count: layout.inode_count,
            volume_name: Some(superblock.volume_name()).filter(|n| !n.is_empty()),
        };
        let device = self.inodes.cache().device().clone();

        self.handles.clear(&mut self.inodes);
        self.inodes.clear_pins();
        self.inodes.cache().clear();
        self.inodes = format::format(device, &options, self.config.cache_blocks)?;
        session.cwd.clear();

        log::info!("VFS: Disk reformatted by '{}'", session.user);
        Ok(())
    }

    /// Audit the whole filesystem without changing it
    pub fn check_disk(&self) -> Result<CheckReport> {
        ConsistencyChecker::new(&self.inodes).run()
    }

    pub fn statfs(&self) -> FsStats {
        let alloc = self.inodes.allocator();
        let layout = alloc.layout();
        FsStats {
            volume_name: alloc.superblock().volume_name(),
            block_size: layout.block_size,
            total_blocks: layout.block_count,
            free_blocks: alloc.free_blocks(),
            metadata_blocks: layout.metadata_blocks(),
            // Slot 0 is never usable
            total_inodes: layout.inode_count - 1,
            free_inodes: alloc.free_inodes(),
        }
    }

    pub fn handles(&self) -> &OpenFileTable {
        &self.handles
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Flush the backing device
    pub fn sync(&self) -> Result<()> {
        self.inodes.cache().sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("inodes", &self.inodes)
            .field("open_handles", &self.handles.len())
            .field("config", &self.config)
            .finish()
    }
}
