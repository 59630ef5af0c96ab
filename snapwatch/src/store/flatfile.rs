//! A flat-file implementation of [`Store`]: one JSON file per fingerprint.
//!
//! Only the latest snapshot is kept per fingerprint, so deep history and
//! [`Store::delete_latest`] are unsupported. Useful for setups where snapshot
//! payloads should stay inspectable with ordinary shell tools.
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{Snapshot, Store, StoreError};

/// Snapshot storage as individual files in a directory, keyed by fingerprint.
#[derive(Clone)]
pub struct FlatFileStore {
    dir: PathBuf,
    staged: Arc<RwLock<Vec<(String, Snapshot)>>>,
}

impl FlatFileStore {
    /// Opens (creating if needed) the directory holding the snapshot files.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_owned();
        std::fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "storing snapshots as individual files");
        Ok(Self {
            dir,
            staged: Arc::new(RwLock::new(Vec::new())),
        })
    }

    fn path_for(&self, guid: &str) -> PathBuf {
        self.dir.join(guid)
    }

    fn read(&self, guid: &str) -> Result<Option<Snapshot>, StoreError> {
        let path = self.path_for(guid);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

#[async_trait]
impl Store for FlatFileStore {
    async fn load(&self, guid: &str) -> Result<Snapshot, StoreError> {
        Ok(self.read(guid)?.unwrap_or_default())
    }

    async fn save(&self, guid: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        self.staged
            .write()
            .map_err(|_| StoreError::BadState)?
            .push((guid.to_owned(), snapshot));
        Ok(())
    }

    async fn history(&self, guid: &str, count: Option<usize>) -> Result<Vec<Snapshot>, StoreError> {
        if count == Some(0) {
            return Ok(Vec::new());
        }
        // A single snapshot is retained per fingerprint.
        Ok(self
            .read(guid)?
            .filter(|snapshot| snapshot.tries == 0 && snapshot.exists())
            .into_iter()
            .collect())
    }

    async fn guids(&self) -> Result<HashSet<String>, StoreError> {
        let mut guids = HashSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                guids.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(guids)
    }

    async fn delete(&self, guid: &str) -> Result<(), StoreError> {
        let path = self.path_for(guid);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn delete_latest(&self, _guid: &str) -> Result<Option<Snapshot>, StoreError> {
        Err(StoreError::Unsupported(
            "the flat-file engine keeps a single snapshot; delete the whole fingerprint instead",
        ))
    }

    async fn commit(&self, delete_staged: bool) -> Result<(), StoreError> {
        let rows = {
            let mut staged = self.staged.write().map_err(|_| StoreError::BadState)?;
            if delete_staged {
                std::mem::take(&mut *staged)
            } else {
                staged.clone()
            }
        };
        // Later saves for the same fingerprint overwrite earlier ones, which
        // leaves exactly the most recent snapshot on disk.
        for (guid, snapshot) in rows {
            let encoded = serde_json::to_string(&snapshot)?;
            std::fs::write(self.path_for(&guid), encoded)?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.staged
            .write()
            .map_err(|_| StoreError::BadState)?
            .clear();
        Ok(())
    }

    async fn gc(&self, known_guids: &HashSet<String>, _keep: usize) -> Result<(), StoreError> {
        for guid in self.guids().await?.difference(known_guids) {
            tracing::info!(%guid, "deleting snapshot file no longer being tracked");
            self.delete(guid).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn store() -> (tempfile::TempDir, FlatFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatFileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn load_unknown_guid_is_zero_value() {
        let (_dir, store) = store();
        assert_eq!(store.load("missing").await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn staged_save_invisible_until_commit() {
        let (_dir, store) = store();
        store.save("guid", Snapshot::new("x", 100, 0, "")).await.unwrap();
        assert!(!store.load("guid").await.unwrap().exists());
        store.commit(true).await.unwrap();
        assert_eq!(store.load("guid").await.unwrap().data, "x");
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let (_dir, store) = store();
        store.save("guid", Snapshot::new("x", 100, 0, "")).await.unwrap();
        store.rollback().await.unwrap();
        store.commit(true).await.unwrap();
        assert!(!store.load("guid").await.unwrap().exists());
    }

    #[tokio::test]
    async fn only_latest_snapshot_survives_commit() {
        let (_dir, store) = store();
        store.save("guid", Snapshot::new("x", 100, 0, "")).await.unwrap();
        store.save("guid", Snapshot::new("y", 200, 0, "")).await.unwrap();
        store.commit(true).await.unwrap();
        assert_eq!(store.load("guid").await.unwrap().data, "y");
        assert_eq!(store.history("guid", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_skips_failure_resaves() {
        let (_dir, store) = store();
        store.save("guid", Snapshot::new("x", 100, 2, "")).await.unwrap();
        store.commit(true).await.unwrap();
        assert!(store.history("guid", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_latest_is_unsupported() {
        let (_dir, store) = store();
        assert_matches!(
            store.delete_latest("guid").await,
            Err(StoreError::Unsupported(_))
        );
    }

    #[tokio::test]
    async fn gc_removes_untracked_fingerprints() {
        let (_dir, store) = store();
        store.save("keep", Snapshot::new("x", 100, 0, "")).await.unwrap();
        store.save("drop", Snapshot::new("y", 100, 0, "")).await.unwrap();
        store.commit(true).await.unwrap();
        let known = HashSet::from(["keep".to_owned()]);
        store.gc(&known, 1).await.unwrap();
        assert_eq!(store.guids().await.unwrap(), known);
    }
}
