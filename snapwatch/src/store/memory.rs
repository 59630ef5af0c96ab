//! Provides an in-memory implementation of [`Store`].
//!
//! It is a correct (but not optimized) reference implementation of the
//! contract, primarily intended for tests and short-lived runs where nothing
//! should outlive the process.
use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use fxhash::FxHashMap;

use super::{dedup_history, Snapshot, Store, StoreError};

/// An in-memory implementation of [`Store`].
///
/// Committed histories live in a per-fingerprint vector, newest first; staged
/// saves accumulate in an append log until [`Store::commit`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    committed: Arc<RwLock<FxHashMap<String, Vec<Snapshot>>>>,
    staged: Arc<RwLock<Vec<(String, Snapshot)>>>,
    max_snapshots: usize,
}

impl MemoryStore {
    /// Creates a new instance of [`MemoryStore`] with no retention limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `max_snapshots` entries per fingerprint (0 = unlimited),
    /// enforced at commit time.
    pub fn with_max_snapshots(mut self, max_snapshots: usize) -> Self {
        self.max_snapshots = max_snapshots;
        self
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, guid: &str) -> Result<Snapshot, StoreError> {
        Ok(self
            .committed
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(guid)
            .and_then(|history| history.first())
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, guid: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        self.staged
            .write()
            .map_err(|_| StoreError::BadState)?
            .push((guid.to_owned(), snapshot));
        Ok(())
    }

    async fn history(&self, guid: &str, count: Option<usize>) -> Result<Vec<Snapshot>, StoreError> {
        let rows = self
            .committed
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(guid)
            .cloned()
            .unwrap_or_default();
        Ok(dedup_history(rows, count))
    }

    async fn guids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .committed
            .read()
            .map_err(|_| StoreError::BadState)?
            .keys()
            .cloned()
            .collect())
    }

    async fn delete(&self, guid: &str) -> Result<(), StoreError> {
        self.committed
            .write()
            .map_err(|_| StoreError::BadState)?
            .remove(guid);
        Ok(())
    }

    async fn delete_latest(&self, guid: &str) -> Result<Option<Snapshot>, StoreError> {
        let mut committed = self.committed.write().map_err(|_| StoreError::BadState)?;
        let Some(history) = committed.get_mut(guid) else {
            return Ok(None);
        };
        if history.is_empty() {
            return Ok(None);
        }
        Ok(Some(history.remove(0)))
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
        let mut committed = self.committed.write().map_err(|_| StoreError::BadState)?;
        for (guid, snapshot) in rows {
            committed.entry(guid).or_default().insert(0, snapshot);
        }
        if self.max_snapshots > 0 {
            for history in committed.values_mut() {
                history.truncate(self.max_snapshots);
            }
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

    async fn gc(&self, known_guids: &HashSet<String>, keep: usize) -> Result<(), StoreError> {
        let mut committed = self.committed.write().map_err(|_| StoreError::BadState)?;
        committed.retain(|guid, _| known_guids.contains(guid));
        if keep > 0 {
            for history in committed.values_mut() {
                history.truncate(keep);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
