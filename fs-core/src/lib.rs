//! tinyext Core - an ext2-flavored filesystem on a virtual disk
//!
//! This crate provides the filesystem engine behind the `tinyext` shell: block
//! and inode allocation, the inode table with direct and single-indirect block
//! maps, directories, path resolution, open-file handles, permission checks,
//! formatting and a read-only consistency checker.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tinyext::{Access, Credentials, FileSystem, FormatOptions, FsConfig, Mode};
//! use tinyext::blockdev::MemoryBlockDevice;
//!
//! # fn main() -> tinyext::Result<()> {
//! let options = FormatOptions::default();
//! let disk = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
//! let mut fs = FileSystem::format(disk, &options, FsConfig::default())?;
//! let session = fs.open_session("root", Credentials::ROOT);
//!
//! fs.make_directory(&session, "/docs", Mode::DEFAULT_DIR)?;
//! fs.create_file(&session, "/docs/readme", Mode::DEFAULT_FILE)?;
//! let handle = fs.open_file(&session, "/docs/readme", Access::Write)?;
//! fs.write_file(&session, handle, b"hello")?;
//! fs.close_file(&session, handle)?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod bitmap;
pub mod blockdev;
pub mod cache;
pub mod check;
pub mod config;
pub mod dir;
pub mod error;
pub mod format;
pub mod handle;
pub mod inode;
pub mod layout;
pub mod path;
pub mod perm;
pub mod session;
pub mod vfs;

pub use check::{CheckReport, Violation, ViolationKind};
pub use config::{FsConfig, RemovePolicy};
pub use dir::{DirEntry, FileName};
pub use error::{FsError, Result};
pub use format::FormatOptions;
pub use handle::HandleId;
pub use inode::{Inode, InodeId, InodeKind};
pub use perm::{Access, Credentials, Mode, OwnershipPolicy};
pub use session::{Session, SessionId};
pub use vfs::{FileSystem, FsStats};

/// Inode number of the root directory
pub const ROOT_INODE: u64 = 1;
/// Direct block pointers per inode
pub const DIRECT_BLOCKS: usize = 12;
/// Longest directory entry name in bytes
pub const MAX_NAME_LEN: usize = 56;
/// Longest path accepted by the resolver, in bytes
pub const MAX_PATH_LEN: usize = 1024;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::BlockDevice;
    pub use crate::error::{FsError, Result};
    pub use crate::perm::{Access, Credentials, Mode};
    pub use crate::session::Session;
    pub use crate::vfs::FileSystem;
}
