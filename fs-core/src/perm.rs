//! Permission model: mode bits, caller credentials and access checks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FsError, Result};
use crate::inode::Inode;

/// Owner/group/other rwx bits, as given to `chmod` in octal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(u16);

impl Mode {
    /// Default mode for new directories (rwxr-xr-x)
    pub const DEFAULT_DIR: Mode = Mode(0o755);
    /// Default mode for new files (rw-r--r--)
    pub const DEFAULT_FILE: Mode = Mode(0o644);
    pub const MAX: u16 = 0o777;

    pub fn new(bits: u16) -> Result<Self> {
        if bits > Self::MAX {
            return Err(FsError::InvalidArgument(format!(
                "mode {:o} exceeds {:o}",
                bits,
                Self::MAX
            )));
        }
        Ok(Mode(bits))
    }

    /// Parse an octal mode string such as "640"
    pub fn parse_octal(text: &str) -> Result<Self> {
        let bits = u16::from_str_radix(text, 8)
            .map_err(|_| FsError::InvalidArgument(format!("'{}' is not an octal mode", text)))?;
        Self::new(bits)
    }

    /// Decode a mode read from disk, dropping any bits outside the 9-bit range
    pub(crate) fn from_raw(bits: u16) -> Self {
        Mode(bits & Self::MAX)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// The rwx triple that applies to `class`
    fn triple(self, class: Class) -> u16 {
        match class {
            Class::Owner => (self.0 >> 6) & 0o7,
            Class::Group => (self.0 >> 3) & 0o7,
            Class::Other => self.0 & 0o7,
        }
    }
}

impl FromStr for Mode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_octal(s)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in [Class::Owner, Class::Group, Class::Other] {
            let bits = self.triple(class);
            let r = if bits & 0o4 != 0 { 'r' } else { '-' };
            let w = if bits & 0o2 != 0 { 'w' } else { '-' };
            let x = if bits & 0o1 != 0 { 'x' } else { '-' };
            write!(f, "{}{}{}", r, w, x)?;
        }
        Ok(())
    }
}

impl fmt::Octal for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Octal::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Owner,
    Group,
    Other,
}

/// Requested access when opening a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn can_read(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    fn required_bits(self) -> u16 {
        match self {
            Access::Read => 0o4,
            Access::Write => 0o2,
            Access::ReadWrite => 0o6,
        }
    }
}

impl FromStr for Access {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Access::Read),
            "w" => Ok(Access::Write),
            "rw" | "wr" => Ok(Access::ReadWrite),
            other => Err(FsError::InvalidArgument(format!(
                "access mode '{}' (expected r, w or rw)",
                other
            ))),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "r"),
            Access::Write => write!(f, "w"),
            Access::ReadWrite => write!(f, "rw"),
        }
    }
}

/// Identity of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Whether ownership is required to change or delete an inode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipPolicy {
    /// Only the owner (or root) may `chmod`
    pub enforce_chmod: bool,
    /// Only the owner (or root) may remove
    pub enforce_remove: bool,
}

/// Check that `creds` may open `inode` with `access`
pub fn check_access(inode: &Inode, creds: &Credentials, access: Access) -> Result<()> {
    if creds.is_root() {
        return Ok(());
    }

    let class = if inode.uid == creds.uid {
        Class::Owner
    } else if inode.gid == creds.gid {
        Class::Group
    } else {
        Class::Other
    };

    let needed = access.required_bits();
    if inode.mode.triple(class) & needed == needed {
        Ok(())
    } else {
        log::warn!(
            "PERM: uid {} denied {} on inode {} (mode {})",
            creds.uid,
            access,
            inode.id,
            inode.mode
        );
        Err(FsError::PermissionDenied)
    }
}

/// Check that `creds` owns `inode`
pub fn check_owner(inode: &Inode, creds: &Credentials) -> Result<()> {
    if creds.is_root() || inode.uid == creds.uid {
        Ok(())
    } else {
        log::warn!(
            "PERM: uid {} does not own inode {} (owner {})",
            creds.uid,
            inode.id,
            inode.uid
        );
        Err(FsError::PermissionDenied)
    }
}
