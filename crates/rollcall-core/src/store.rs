//! Per-user durable JSON store.
//!
//! Every persisted file lives under `<root>/<user>/`, so a shared device
//! never mixes queue or cache state across accounts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Open the namespace for `user_id` below `root`, creating it if needed.
    pub fn open(root: &Path, user_id: &str) -> Result<Self> {
        Self::in_dir(root.join(namespace(user_id)))
    }

    pub fn in_dir(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read store file: {}", name))?;

        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store file: {}", name))?;

        Ok(Some(value))
    }

    /// Write through a temp file and rename so a crash never leaves a torn file.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = self.dir.join(format!("{}.json.tmp", name));
        let contents = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write store file: {}", name))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace store file: {}", name))?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Directory name for a user id. Ids that are not plain identifiers are
/// hex-encoded so they can never escape the root or collide after escaping.
fn namespace(user_id: &str) -> String {
    let plain = !user_id.is_empty()
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        user_id.to_string()
    } else {
        let hex: String = user_id.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("x{}", hex)
    }
}
