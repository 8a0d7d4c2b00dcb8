//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FsError, Result};
use crate::perm::OwnershipPolicy;

/// Default LRU capacity in blocks
pub const DEFAULT_CACHE_BLOCKS: usize = 64;

/// What `remove` does when the target is a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovePolicy {
    /// Delete the directory and everything below it
    #[default]
    Recursive,
    /// Behave like `rmdir`
    RequireEmpty,
}

/// Runtime settings for a mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Blocks held by the read cache; 0 disables it
    pub cache_blocks: usize,
    pub ownership: OwnershipPolicy,
    pub remove_directories: RemovePolicy,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            ownership: OwnershipPolicy::default(),
            remove_directories: RemovePolicy::default(),
        }
    }
}

impl FsConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| FsError::InvalidArgument(format!("invalid configuration: {}", e)))
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FsConfig::default();
        assert_eq!(config.cache_blocks, DEFAULT_CACHE_BLOCKS);
        assert!(!config.ownership.enforce_chmod);
        assert!(!config.ownership.enforce_remove);
        assert_eq!(config.remove_directories, RemovePolicy::Recursive);
    }

    #[test]
    fn test_partial_json() {
        let config = FsConfig::from_json(
            r#"{"ownership": {"enforce_chmod": true}, "remove_directories": "require_empty"}"#,
        )
        .unwrap();
        assert!(config.ownership.enforce_chmod);
        assert!(!config.ownership.enforce_remove);
        assert_eq!(config.remove_directories, RemovePolicy::RequireEmpty);
        assert_eq!(config.cache_blocks, DEFAULT_CACHE_BLOCKS);

        assert!(matches!(
            FsConfig::from_json("{not json"),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
