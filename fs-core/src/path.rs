//! Path resolution
//!
//! Paths are `/`-separated. A leading `/` starts at the root, anything else
//! starts at the caller's working directory. `.` and `..` are resolved on the
//! name stack, never by looking up stored entries, so `..` at the root stays
//! at the root.

use crate::dir::{FileName, DOT, DOT_DOT};
use crate::error::{FsError, Result};
use crate::inode::{InodeId, InodeKind, InodeTable};
use crate::{MAX_PATH_LEN, ROOT_INODE};

/// Path separator
pub const SEPARATOR: char = '/';

/// Outcome of resolving a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub inode: InodeId,
    pub kind: InodeKind,
    /// Names from the root down to the target
    pub path: Vec<FileName>,
}

/// Outcome of resolving everything but the last component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    /// Directory that holds (or would hold) the target
    pub parent: InodeId,
    pub parent_path: Vec<FileName>,
    /// Last component of the path
    pub name: FileName,
}

/// Render a name stack as an absolute path
pub fn display_path(path: &[FileName]) -> String {
    if path.is_empty() {
        return SEPARATOR.to_string();
    }
    path.iter().fold(String::new(), |mut out, name| {
        out.push(SEPARATOR);
        out.push_str(name.as_str());
        out
    })
}

/// Walks names through directory entries
pub struct PathResolver<'a> {
    inodes: &'a InodeTable,
}

impl<'a> PathResolver<'a> {
    pub fn new(inodes: &'a InodeTable) -> Self {
        Self { inodes }
    }

    /// Resolve `expr` relative to `cwd`
    pub fn resolve(&self, cwd: &[FileName], expr: &str) -> Result<Resolved> {
        let names = Self::normalize(cwd, expr)?;
        self.walk(names)
    }

    /// Resolve the directory that holds the last component of `expr`.
    ///
    /// The last component itself need not exist.
    pub fn resolve_parent(&self, cwd: &[FileName], expr: &str) -> Result<ParentRef> {
        Self::check_length(expr)?;
        let trimmed = expr.trim_end_matches(SEPARATOR);
        let (dir_part, last) = match trimmed.rfind(SEPARATOR) {
            Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if last.is_empty() || last == DOT || last == DOT_DOT {
            return Err(FsError::InvalidName(format!(
                "'{}' does not name an entry",
                expr
            )));
        }
        let name = FileName::new(last)?;

        let parent = if dir_part.is_empty() {
            self.walk(cwd.to_vec())?
        } else {
            self.resolve(cwd, dir_part)?
        };
        if parent.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }

        Ok(ParentRef {
            parent: parent.inode,
            parent_path: parent.path,
            name,
        })
    }

    fn check_length(expr: &str) -> Result<()> {
        if expr.len() > MAX_PATH_LEN {
            return Err(FsError::InvalidName(format!(
                "path is longer than {} bytes",
                MAX_PATH_LEN
            )));
        }
        Ok(())
    }

    /// Fold `expr` onto `cwd`, producing the absolute name stack
    fn normalize(cwd: &[FileName], expr: &str) -> Result<Vec<FileName>> {
        Self::check_length(expr)?;
        if expr.is_empty() {
            return Err(FsError::InvalidName("empty path".into()));
        }

        let mut names = if expr.starts_with(SEPARATOR) {
            Vec::new()
        } else {
            cwd.to_vec()
        };
        for component in expr.split(SEPARATOR) {
            match component {
                "" | DOT => {}
                DOT_DOT => {
                    names.pop();
                }
                name => names.push(FileName::new(name)?),
            }
        }
        Ok(names)
    }

    fn walk(&self, names: Vec<FileName>) -> Result<Resolved> {
        let mut current = ROOT_INODE;
        let mut kind = InodeKind::Directory;
        for name in &names {
            if kind != InodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            let entry = self.inodes.lookup(current, name.as_str())?;
            current = entry.inode;
            kind = entry.kind;
        }

        // Entries carry the kind; confirm against the inode itself
        let inode = self.inodes.get(current)?;
        Ok(Resolved {
            inode: current,
            kind: inode.kind,
            path: names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::format::{format, FormatOptions};
    use crate::perm::{Credentials, Mode};
    use std::sync::Arc;

    /// Root with /a/b and file /a/f
    fn tree() -> (InodeTable, InodeId, InodeId, InodeId) {
        let options = FormatOptions::default();
        let device = Arc::new(MemoryBlockDevice::new(options.block_count, options.block_size));
        let mut table = format(device, &options, 16).unwrap();
        let root = Credentials::ROOT;
        let a = table
            .create_directory(ROOT_INODE, &FileName::new("a").unwrap(), Mode::DEFAULT_DIR, &root)
            .unwrap();
        let b = table
            .create_directory(a, &FileName::new("b").unwrap(), Mode::DEFAULT_DIR, &root)
            .unwrap();
        let f = table
            .create_file(a, &FileName::new("f").unwrap(), Mode::DEFAULT_FILE, &root)
            .unwrap();
        (table, a, b, f)
    }

    fn names(parts: &[&str]) -> Vec<FileName> {
        parts.iter().map(|p| FileName::new(p).unwrap()).collect()
    }

    #[test]
    fn test_absolute_and_relative() {
        let (table, a, b, f) = tree();
        let resolver = PathResolver::new(&table);

        assert_eq!(resolver.resolve(&[], "/").unwrap().inode, ROOT_INODE);
        assert_eq!(resolver.resolve(&[], "/a/b").unwrap().inode, b);
        assert_eq!(resolver.resolve(&names(&["a"]), "b").unwrap().inode, b);
        assert_eq!(resolver.resolve(&names(&["a", "b"]), "../f").unwrap().inode, f);
        assert_eq!(resolver.resolve(&names(&["a", "b"]), "/a").unwrap().inode, a);

        let resolved = resolver.resolve(&names(&["a"]), "./b/.").unwrap();
        assert_eq!(resolved.path, names(&["a", "b"]));
        assert_eq!(display_path(&resolved.path), "/a/b");
    }

    #[test]
    fn test_dot_dot_at_root_stays() {
        let (table, ..) = tree();
        let resolver = PathResolver::new(&table);
        let resolved = resolver.resolve(&[], "../../..").unwrap();
        assert_eq!(resolved.inode, ROOT_INODE);
        assert!(resolved.path.is_empty());
        assert_eq!(display_path(&resolved.path), "/");
    }

    #[test]
    fn test_failures() {
        let (table, ..) = tree();
        let resolver = PathResolver::new(&table);

        assert!(matches!(resolver.resolve(&[], "/missing"), Err(FsError::NotFound)));
        assert!(matches!(resolver.resolve(&[], "/a/f/x"), Err(FsError::NotADirectory)));
        assert!(matches!(resolver.resolve(&[], ""), Err(FsError::InvalidName(_))));
        let long = "x/".repeat(MAX_PATH_LEN);
        assert!(matches!(resolver.resolve(&[], &long), Err(FsError::InvalidName(_))));
    }

    #[test]
    fn test_resolve_parent() {
        let (table, a, ..) = tree();
        let resolver = PathResolver::new(&table);

        let parent = resolver.resolve_parent(&[], "/a/new").unwrap();
        assert_eq!(parent.parent, a);
        assert_eq!(parent.name.as_str(), "new");
        assert_eq!(parent.parent_path, names(&["a"]));

        let parent = resolver.resolve_parent(&names(&["a"]), "new/").unwrap();
        assert_eq!(parent.parent, a);

        assert!(matches!(
            resolver.resolve_parent(&[], "/"),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            resolver.resolve_parent(&[], "/a/.."),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            resolver.resolve_parent(&[], "/a/f/x"),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(
            resolver.resolve_parent(&[], "/nope/x"),
            Err(FsError::NotFound)
        ));
    }
}
