//! Open file table
//!
//! Handles belong to the session that opened them. Every open handle pins its
//! inode in the [`InodeTable`] so the inode cannot be freed underneath it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FsError, Result};
use crate::inode::{InodeId, InodeKind, InodeTable};
use crate::path::PathResolver;
use crate::perm::{check_access, Access};
use crate::session::{Session, SessionId};

/// Identifies an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of one open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub id: HandleId,
    pub inode: InodeId,
    /// Byte position of the next read or write
    pub offset: u64,
    pub access: Access,
    pub session: SessionId,
}

/// All open handles
#[derive(Debug, Default)]
pub struct OpenFileTable {
    handles: BTreeMap<HandleId, OpenFile>,
    next_id: u64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Open the file at `path` for `access`, with the cursor at 0
    pub fn open(
        &mut self,
        inodes: &mut InodeTable,
        session: &Session,
        path: &str,
        access: Access,
    ) -> Result<HandleId> {
        let resolved = PathResolver::new(inodes).resolve(&session.cwd, path)?;
        if resolved.kind == InodeKind::Directory {
            return Err(FsError::NotAFile);
        }
        let inode = inodes.get(resolved.inode)?;
        check_access(&inode, &session.creds, access)?;

        let id = HandleId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        inodes.pin(inode.id);
        self.handles.insert(
            id,
            OpenFile {
                id,
                inode: inode.id,
                offset: 0,
                access,
                session: session.id,
            },
        );

        log::debug!(
            "HANDLE: {} opened inode {} as handle {} ({})",
            session.id,
            inode.id,
            id,
            access
        );
        Ok(id)
    }

    fn owned(&self, session: &Session, handle: HandleId) -> Result<&OpenFile> {
        self.handles
            .get(&handle)
            .filter(|open| open.session == session.id)
            .ok_or(FsError::NotFound)
    }

    fn owned_mut(&mut self, session: &Session, handle: HandleId) -> Result<&mut OpenFile> {
        self.handles
            .get_mut(&handle)
            .filter(|open| open.session == session.id)
            .ok_or(FsError::NotFound)
    }

    /// Close one handle; closing it twice fails `NotFound`
    pub fn close(
        &mut self,
        inodes: &mut InodeTable,
        session: &Session,
        handle: HandleId,
    ) -> Result<()> {
        let inode = self.owned(session, handle)?.inode;
        self.handles.remove(&handle);
        inodes.unpin(inode);
        log::debug!("HANDLE: Closed handle {} (inode {})", handle, inode);
        Ok(())
    }

    /// Close every handle `session` holds on `inode`
    pub fn close_inode(
        &mut self,
        inodes: &mut InodeTable,
        session: &Session,
        inode: InodeId,
    ) -> Result<usize> {
        let ids: Vec<HandleId> = self
            .handles
            .values()
            .filter(|open| open.session == session.id && open.inode == inode)
            .map(|open| open.id)
            .collect();
        if ids.is_empty() {
            return Err(FsError::NotFound);
        }
        for id in &ids {
            self.handles.remove(id);
            inodes.unpin(inode);
        }
        Ok(ids.len())
    }

    /// Close everything a session left open
    pub fn close_session(&mut self, inodes: &mut InodeTable, session: SessionId) -> usize {
        let ids: Vec<HandleId> = self
            .handles
            .values()
            .filter(|open| open.session == session)
            .map(|open| open.id)
            .collect();
        for id in &ids {
            if let Some(open) = self.handles.remove(id) {
                inodes.unpin(open.inode);
            }
        }
        if !ids.is_empty() {
            log::info!("HANDLE: Closed {} handles left open by {}", ids.len(), session);
        }
        ids.len()
    }

    /// Read up to `len` bytes at the cursor and advance it.
    ///
    /// Returns fewer bytes at end of file and none once the cursor reaches it.
    pub fn read(
        &mut self,
        inodes: &InodeTable,
        session: &Session,
        handle: HandleId,
        len: usize,
    ) -> Result<Vec<u8>> {
        let open = self.owned_mut(session, handle)?;
        if !open.access.can_read() {
            return Err(FsError::PermissionDenied);
        }
        let inode = inodes.get(open.inode)?;
        let data = inodes.read_data(&inode, open.offset, len)?;
        open.offset += data.len() as u64;
        Ok(data)
    }

    /// Write `bytes` at the cursor and advance it
    pub fn write(
        &mut self,
        inodes: &mut InodeTable,
        session: &Session,
        handle: HandleId,
        bytes: &[u8],
    ) -> Result<usize> {
        let open = self.owned_mut(session, handle)?;
        if !open.access.can_write() {
            return Err(FsError::PermissionDenied);
        }
        let written = inodes.write_data(open.inode, open.offset, bytes)?;
        open.offset += written as u64;
        Ok(written)
    }

    /// Move the cursor; it may not pass the end of the file
    pub fn seek(
        &mut self,
        inodes: &InodeTable,
        session: &Session,
        handle: HandleId,
        offset: u64,
    ) -> Result<()> {
        let open = self.owned_mut(session, handle)?;
        let size = inodes.get(open.inode)?.size;
        if offset > size {
            return Err(FsError::InvalidArgument(format!(
                "offset {} is past the end of the file ({} bytes)",
                offset, size
            )));
        }
        open.offset = offset;
        Ok(())
    }

    pub fn get(&self, handle: HandleId) -> Option<&OpenFile> {
        self.handles.get(&handle)
    }

    /// Open handles in id order
    pub fn iter(&self) -> impl Iterator<Item = &OpenFile> {
        self.handles.values()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop every handle, e.g. after the disk is reformatted
    pub fn clear(&mut self, inodes: &mut InodeTable) {
        for open in self.handles.values() {
            inodes.unpin(open.inode);
        }
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::dir::FileName;
    use crate::format::{format, FormatOptions};
    use crate::perm::{Credentials, Mode};
    use crate::ROOT_INODE;
    use std::sync::Arc;

    fn setup() -> (InodeTable, OpenFileTable, Session) {
        let options = FormatOptions::default();
        let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
        let mut table = format(device, &options, 16).unwrap();
        table
            .create_file(
                ROOT_INODE,
                &FileName::new("f").unwrap(),
                Mode::new(0o640).unwrap(),
                &Credentials::new(1000, 100),
            )
            .unwrap();
        let session = Session::new(SessionId(1), "alice", Credentials::new(1000, 100));
        (table, OpenFileTable::new(), session)
    }

    #[test]
    fn test_open_write_read() {
        let (mut inodes, mut handles, session) = setup();
        let h = handles.open(&mut inodes, &session, "/f", Access::ReadWrite).unwrap();

        assert_eq!(handles.write(&mut inodes, &session, h, b"hello world").unwrap(), 11);
        handles.seek(&inodes, &session, h, 0).unwrap();
        assert_eq!(handles.read(&inodes, &session, h, 5).unwrap(), b"hello".to_vec());
        // Short read at end of file, then nothing
        assert_eq!(handles.read(&inodes, &session, h, 100).unwrap(), b" world".to_vec());
        assert!(handles.read(&inodes, &session, h, 100).unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_directories_and_missing() {
        let (mut inodes, mut handles, session) = setup();
        assert!(matches!(
            handles.open(&mut inodes, &session, "/", Access::Read),
            Err(FsError::NotAFile)
        ));
        assert!(matches!(
            handles.open(&mut inodes, &session, "/nope", Access::Read),
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            handles.open(&mut inodes, &session, "/f/x", Access::Read),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn test_permission_checks() {
        let (mut inodes, mut handles, _) = setup();
        let group = Session::new(SessionId(2), "bob", Credentials::new(1001, 100));
        let other = Session::new(SessionId(3), "eve", Credentials::new(1002, 200));

        assert!(handles.open(&mut inodes, &group, "/f", Access::Read).is_ok());
        assert!(matches!(
            handles.open(&mut inodes, &group, "/f", Access::Write),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            handles.open(&mut inodes, &other, "/f", Access::Read),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_access_mode_is_enforced_per_handle() {
        let (mut inodes, mut handles, session) = setup();
        let h = handles.open(&mut inodes, &session, "/f", Access::Read).unwrap();
        assert!(matches!(
            handles.write(&mut inodes, &session, h, b"x"),
            Err(FsError::PermissionDenied)
        ));

        let w = handles.open(&mut inodes, &session, "/f", Access::Write).unwrap();
        assert!(matches!(
            handles.read(&inodes, &session, w, 1),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_close_and_pins() {
        let (mut inodes, mut handles, session) = setup();
        let h = handles.open(&mut inodes, &session, "/f", Access::Read).unwrap();
        let inode = handles.get(h).unwrap().inode;
        assert!(inodes.is_pinned(inode));

        handles.close(&mut inodes, &session, h).unwrap();
        assert!(!inodes.is_pinned(inode));
        assert!(matches!(
            handles.close(&mut inodes, &session, h),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_handles_are_session_scoped() {
        let (mut inodes, mut handles, session) = setup();
        let intruder = Session::new(SessionId(9), "root", Credentials::ROOT);
        let h = handles.open(&mut inodes, &session, "/f", Access::Read).unwrap();

        assert!(matches!(
            handles.close(&mut inodes, &intruder, h),
            Err(FsError::NotFound)
        ));
        assert_eq!(handles.close_session(&mut inodes, session.id), 1);
        assert!(handles.is_empty());
    }

    #[test]
    fn test_close_by_inode() {
        let (mut inodes, mut handles, session) = setup();
        let h1 = handles.open(&mut inodes, &session, "/f", Access::Read).unwrap();
        handles.open(&mut inodes, &session, "f", Access::Read).unwrap();
        let inode = handles.get(h1).unwrap().inode;

        assert_eq!(handles.close_inode(&mut inodes, &session, inode).unwrap(), 2);
        assert!(!inodes.is_pinned(inode));
        assert!(matches!(
            handles.close_inode(&mut inodes, &session, inode),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_read_any_length_after_seek() {
        let (mut inodes, mut handles, session) = setup();
        let h = handles.open(&mut inodes, &session, "/f", Access::ReadWrite).unwrap();
        handles.write(&mut inodes, &session, h, b"hello").unwrap();
        handles.seek(&inodes, &session, h, 2).unwrap();

        let data = handles.read(&inodes, &session, h, usize::MAX).unwrap();
        assert_eq!(data, b"llo".to_vec());
        assert!(handles.read(&inodes, &session, h, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_seek_past_end() {
        let (mut inodes, mut handles, session) = setup();
        let h = handles.open(&mut inodes, &session, "/f", Access::Write).unwrap();
        handles.write(&mut inodes, &session, h, b"abc").unwrap();
        assert!(handles.seek(&inodes, &session, h, 3).is_ok());
        assert!(matches!(
            handles.seek(&inodes, &session, h, 4),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
