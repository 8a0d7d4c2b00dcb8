//! Caller context passed into every engine operation

use std::fmt;

use crate::dir::FileName;
use crate::path::display_path;
use crate::perm::Credentials;

/// Identifies a session in the open-file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// A logged-in user and their working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub creds: Credentials,
    /// Working directory as names from the root
    pub cwd: Vec<FileName>,
}

impl Session {
    pub fn new(id: SessionId, user: impl Into<String>, creds: Credentials) -> Self {
        Self {
            id,
            user: user.into(),
            creds,
            cwd: Vec::new(),
        }
    }

    /// Working directory as an absolute path string
    pub fn display_path(&self) -> String {
        display_path(&self.cwd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_path() {
        let mut session = Session::new(SessionId(1), "guest", Credentials::new(1000, 1000));
        assert_eq!(session.display_path(), "/");

        session.cwd = vec![FileName::new("home").unwrap(), FileName::new("guest").unwrap()];
        assert_eq!(session.display_path(), "/home/guest");
    }
}
