use std::fmt;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// A resource tracked by one of the allocation bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Block(u64),
    Inode(u64),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Block(id) => write!(f, "block {}", id),
            Resource::Inode(id) => write!(f, "inode {}", id),
        }
    }
}

/// Filesystem error type
///
/// Every engine operation is all-or-nothing: when one of these is returned,
/// no bitmap, inode or directory entry has been left half-updated. The only
/// exception is [`FsError::Io`], which means the backing store itself failed.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(BlockDeviceError),
    #[error("No such file or directory")]
    NotFound,
    #[error("Name already exists")]
    DuplicateName,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Not a regular file")]
    NotAFile,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("No space left on disk")]
    DiskFull,
    #[error("Inode table is full")]
    InodeTableFull,
    #[error("Resource busy: file is open")]
    Busy,
    #[error("Block {0} is out of range")]
    OutOfRange(u64),
    #[error("Double free of {0}")]
    DoubleFree(Resource),
    #[error("Filesystem is corrupt: {0}")]
    Corrupt(String),
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsError {
    /// Whether the running session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsError::Io(_))
    }
}

impl From<BlockDeviceError> for FsError {
    fn from(err: BlockDeviceError) -> Self {
        match err {
            BlockDeviceError::InvalidBlockNumber(n) => FsError::OutOfRange(n),
            other => FsError::Io(other),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(BlockDeviceError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_number_maps_to_out_of_range() {
        let err: FsError = BlockDeviceError::InvalidBlockNumber(42).into();
        assert!(matches!(err, FsError::OutOfRange(42)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_io_is_fatal() {
        let err: FsError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(err.is_fatal());
        assert!(!FsError::DiskFull.is_fatal());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            FsError::DoubleFree(Resource::Block(7)).to_string(),
            "Double free of block 7"
        );
        assert_eq!(FsError::NotEmpty.to_string(), "Directory not empty");
    }
}
