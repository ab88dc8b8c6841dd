//! Snapshot files on disk
//!
//! One file per session at `<memory_dir>/<session_key>.snapshot`. Writes go
//! to a uniquely named temp file first and are renamed into place, so a
//! reader never observes a half-written snapshot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::SessionKey;
use crate::error::{ProxyError, Result};

/// File extension used for session snapshots
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the snapshot for `key` lives
    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{key}.{SNAPSHOT_EXTENSION}"))
    }

    /// Read a snapshot; `Ok(None)` when none has been written yet
    pub async fn load(&self, key: &SessionKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Persistence(format!(
                "Failed to read snapshot {}: {e}",
                path.display()
            ))),
        }
    }

    /// Atomically replace the snapshot for `key`
    pub async fn save(&self, key: &SessionKey, blob: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            ProxyError::Persistence(format!(
                "Failed to create memory directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!("{key}.{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(e) = tokio::fs::write(&tmp, blob).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ProxyError::Persistence(format!(
                "Failed to write snapshot {}: {e}",
                tmp.display()
            )));
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ProxyError::Persistence(format!(
                "Failed to move snapshot into place at {}: {e}",
                path.display()
            )));
        }

        Ok(())
    }

    /// Keys that have a snapshot on disk. Files whose names are not valid
    /// session keys are ignored.
    pub async fn keys(&self) -> Result<Vec<SessionKey>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ProxyError::Persistence(format!(
                    "Failed to list memory directory {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| SessionKey::try_from(s).ok())
            {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::generate_session_key;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = generate_session_key("nobody");
        assert!(store.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested"));
        let key = generate_session_key("sk-ant-abc");

        store.save(&key, b"first").await.unwrap();
        store.save(&key, b"second").await.unwrap();

        assert_eq!(store.load(&key).await.unwrap().as_deref(), Some(&b"second"[..]));
        assert!(store.path_for(&key).ends_with(format!("{key}.snapshot")));
    }

    #[tokio::test]
    async fn test_keys_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let a = generate_session_key("a");
        let b = generate_session_key("b");
        store.save(&a, b"{}").await.unwrap();
        store.save(&b, b"{}").await.unwrap();

        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("bad name.snapshot"), "x").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.keys().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_keys_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("never-created"));
        assert!(store.keys().await.unwrap().is_empty());
    }
}
