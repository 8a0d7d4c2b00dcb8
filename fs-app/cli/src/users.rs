//! Login table and the shell's configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use tinyext::{Credentials, FsConfig};

/// One account accepted at the login prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl UserEntry {
    fn new(name: &str, password: &str, uid: u32, gid: u32) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            uid,
            gid,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.uid, self.gid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserTable {
    users: Vec<UserEntry>,
}

impl Default for UserTable {
    fn default() -> Self {
        Self {
            users: vec![
                UserEntry::new("root", "root", 0, 0),
                UserEntry::new("guest", "guest", 1000, 1000),
            ],
        }
    }
}

impl UserTable {
    /// The account matching both name and password
    pub fn authenticate(&self, name: &str, password: &str) -> Option<&UserEntry> {
        self.users
            .iter()
            .find(|user| user.name == name && user.password == password)
    }
}

/// Contents of the `--config` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub filesystem: FsConfig,
    pub users: UserTable,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyext::RemovePolicy;

    #[test]
    fn test_default_accounts() {
        let users = UserTable::default();
        let root = users.authenticate("root", "root").unwrap();
        assert!(root.credentials().is_root());
        assert!(users.authenticate("root", "guest").is_none());
        assert_eq!(users.authenticate("guest", "guest").unwrap().uid, 1000);
    }

    #[test]
    fn test_partial_config() {
        let text = r#"{
            "filesystem": { "remove_directories": "require_empty" },
            "users": [ { "name": "alice", "password": "pw", "uid": 7 } ]
        }"#;
        let config: CliConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.filesystem.remove_directories, RemovePolicy::RequireEmpty);
        assert_eq!(config.filesystem.cache_blocks, FsConfig::default().cache_blocks);

        let alice = config.users.authenticate("alice", "pw").unwrap();
        assert_eq!(alice.gid, 0);
        assert!(config.users.authenticate("root", "root").is_none());
    }
}
