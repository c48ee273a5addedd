//! Per-plugin, per-account persisted state.
//!
//! Pollers use this to remember high-water marks (last seen message id,
//! timestamp) across restarts. Each (plugin, account) pair owns one JSON
//! file named `<plugin>-<account>.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::Result;
use crate::accounts::AccountId;

#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, plugin: &str, account_id: AccountId) -> PathBuf {
        self.root.join(format!("{}-{}.json", plugin, account_id))
    }

    /// Load the stored blob. A missing file is `None`; an unreadable one is
    /// removed and also treated as `None`.
    pub async fn load<T: DeserializeOwned>(
        &self,
        plugin: &str,
        account_id: AccountId,
    ) -> Result<Option<T>> {
        let path = self.path(plugin, account_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), "Discarding corrupt plugin state: {}", e);
                self.remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Replace the stored blob atomically.
    pub async fn store<T: Serialize>(
        &self,
        plugin: &str,
        account_id: AccountId,
        value: &T,
    ) -> Result<()> {
        let path = self.path(plugin, account_id);
        let json = serde_json::to_vec(value)?;

        tokio::fs::create_dir_all(&self.root).await?;

        let temp_path = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&temp_path, &json).await {
            self.remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            self.remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), "Plugin state persisted");
        Ok(())
    }

    pub async fn remove(&self, plugin: &str, account_id: AccountId) {
        self.remove_file(&self.path(plugin, account_id)).await;
    }

    async fn remove_file(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %path.display(), "Failed to remove state file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Mark {
        last_id: String,
        timestamp: i64,
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));
        let mark = Mark {
            last_id: "m-42".into(),
            timestamp: 1_700_000_000,
        };

        store.store("gmail", AccountId(3), &mark).await.unwrap();

        assert!(dir.path().join("state/gmail-3.json").exists());
        let loaded: Option<Mark> = store.load("gmail", AccountId(3)).await.unwrap();
        assert_eq!(loaded, Some(mark));

        let other: Option<Mark> = store.load("gmail", AccountId(4)).await.unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let path = dir.path().join("twitter-9.json");
        std::fs::write(&path, b"{not json").unwrap();

        let loaded: Option<Mark> = store.load("twitter", AccountId(9)).await.unwrap();

        assert!(loaded.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.store("p", AccountId(1), &serde_json::json!({"a": 1})).await.unwrap();

        store.remove("p", AccountId(1)).await;
        store.remove("p", AccountId(1)).await;

        let loaded: Option<serde_json::Value> = store.load("p", AccountId(1)).await.unwrap();
        assert!(loaded.is_none());
    }
}
