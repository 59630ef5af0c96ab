//! Redis-backed snapshot store.
//!
//! Each fingerprint's history is a Redis list (newest at the head) under a
//! namespaced key; snapshots are stored JSON-encoded. Staged writes are
//! buffered in process memory and pushed in one batch at commit time, so a
//! run that never commits leaves Redis untouched.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use snapwatch::store::{dedup_history, Snapshot, Store, StoreError};

/// A [`Store`] keeping snapshot history in Redis lists.
///
/// Clones share the same connection and the same staging buffer.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: NameSpace,
    staged: Arc<Mutex<Vec<(String, Snapshot)>>>,
    max_snapshots: usize,
}

fn map_err(error: RedisError) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    const GUID_SEGMENT: &'static str = ":guid:";

    fn key(&self, guid: &str) -> String {
        format!("{}{}{guid}", self.0, Self::GUID_SEGMENT)
    }

    fn pattern(&self) -> String {
        format!("{}{}*", self.0, Self::GUID_SEGMENT)
    }

    /// Recovers the guid from a key matching [`NameSpace::pattern`].
    fn guid<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.0)
            .and_then(|rest| rest.strip_prefix(Self::GUID_SEGMENT))
    }
}

impl RedisStore {
    /// Connects to Redis at `redis_url`, scoping all keys under `namespace`.
    ///
    /// `max_snapshots` is the per-fingerprint retention limit applied at
    /// commit time; `0` keeps everything.
    pub async fn connect(
        redis_url: &str,
        namespace: impl ToString,
        max_snapshots: usize,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(namespace.to_string()),
            staged: Default::default(),
            max_snapshots,
        })
    }

    fn stage(&self) -> Result<std::sync::MutexGuard<'_, Vec<(String, Snapshot)>>, StoreError> {
        self.staged.lock().map_err(|_| StoreError::BadState)
    }

    async fn read_all(&self, guid: &str) -> Result<Vec<Snapshot>, StoreError> {
        let raw: Vec<String> = self
            .conn
            .clone()
            .lrange(self.namespace.key(guid), 0, -1)
            .await
            .map_err(map_err)?;
        raw.iter()
            .map(|encoded| serde_json::from_str(encoded).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn load(&self, guid: &str) -> Result<Snapshot, StoreError> {
        let head: Option<String> = self
            .conn
            .clone()
            .lindex(self.namespace.key(guid), 0)
            .await
            .map_err(map_err)?;
        match head {
            Some(encoded) => Ok(serde_json::from_str(&encoded)?),
            None => Ok(Snapshot::default()),
        }
    }

    async fn save(&self, guid: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        self.stage()?.push((guid.to_owned(), snapshot));
        Ok(())
    }

    async fn history(&self, guid: &str, count: Option<usize>) -> Result<Vec<Snapshot>, StoreError> {
        let rows = self.read_all(guid).await?;
        Ok(dedup_history(rows, count))
    }

    async fn guids(&self) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> = self
            .conn
            .clone()
            .keys(self.namespace.pattern())
            .await
            .map_err(map_err)?;
        Ok(keys
            .iter()
            .filter_map(|key| self.namespace.guid(key))
            .map(str::to_owned)
            .collect())
    }

    async fn delete(&self, guid: &str) -> Result<(), StoreError> {
        self.conn
            .clone()
            .del::<_, ()>(self.namespace.key(guid))
            .await
            .map_err(map_err)
    }

    async fn delete_latest(&self, guid: &str) -> Result<Option<Snapshot>, StoreError> {
        let head: Option<String> = self
            .conn
            .clone()
            .lpop(self.namespace.key(guid), None)
            .await
            .map_err(map_err)?;
        match head {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, delete_staged: bool) -> Result<(), StoreError> {
        let rows = self.stage()?.clone();
        tracing::debug!(rows = rows.len(), "publishing staged snapshots");

        if !rows.is_empty() {
            // One MULTI/EXEC batch: a concurrent reader sees the whole run
            // or none of it, and a failed commit publishes nothing.
            let mut pipe = redis::pipe();
            pipe.atomic();
            let mut touched = HashSet::new();
            // Pushing in stage order leaves the latest save at the head of
            // each list.
            for (guid, snapshot) in &rows {
                let encoded = serde_json::to_string(snapshot)?;
                pipe.lpush(self.namespace.key(guid), encoded).ignore();
                touched.insert(guid.as_str());
            }
            if self.max_snapshots > 0 {
                for guid in touched {
                    pipe.ltrim(self.namespace.key(guid), 0, self.max_snapshots as isize - 1)
                        .ignore();
                }
            }
            pipe.query_async::<_, ()>(&mut self.conn.clone())
                .await
                .map_err(map_err)?;
        }
        if delete_staged {
            self.stage()?.clear();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let dropped = {
            let mut stage = self.stage()?;
            let dropped = stage.len();
            stage.clear();
            dropped
        };
        tracing::debug!(rows = dropped, "discarded staged snapshots");
        Ok(())
    }

    async fn gc(&self, known_guids: &HashSet<String>, keep: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        for guid in self.guids().await? {
            if !known_guids.contains(&guid) {
                tracing::debug!(%guid, "deleting history for unknown fingerprint");
                conn.del::<_, ()>(self.namespace.key(&guid))
                    .await
                    .map_err(map_err)?;
            } else if keep > 0 {
                conn.ltrim::<_, ()>(self.namespace.key(&guid), 0, keep as isize - 1)
                    .await
                    .map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The connection manager has no explicit shutdown.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use snapwatch::store_test_suite;

    const DEFAULT_URL: &str = "redis://127.0.0.1";

    /// A namespace no other test (or previous test run) has written under.
    fn test_namespace() -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "snapwatch:test:{}:{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    store_test_suite!(for: RedisStore::connect(DEFAULT_URL, test_namespace(), 4).await.unwrap());

    #[tokio::test]
    async fn commit_publishes_a_multi_fingerprint_run_as_one_batch() {
        let store = RedisStore::connect(DEFAULT_URL, test_namespace(), 2)
            .await
            .unwrap();
        for run in 1..=3i64 {
            store
                .save("a", Snapshot::new(format!("a{run}"), run * 100, 0, ""))
                .await
                .unwrap();
            store
                .save("b", Snapshot::new(format!("b{run}"), run * 100, 0, ""))
                .await
                .unwrap();
        }
        store.commit(true).await.unwrap();

        assert_eq!(store.load("a").await.unwrap().data, "a3");
        assert_eq!(store.load("b").await.unwrap().data, "b3");
        // Retention was applied in the same batch.
        assert_eq!(store.history("a", None).await.unwrap().len(), 2);

        // The stage was cleared: committing again replays nothing.
        store.commit(true).await.unwrap();
        assert_eq!(store.history("b", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clones_share_the_staging_area() {
        let store = RedisStore::connect(DEFAULT_URL, test_namespace(), 0)
            .await
            .unwrap();
        store
            .clone()
            .save("guid", Snapshot::new("body", 100, 0, ""))
            .await
            .unwrap();
        store.commit(true).await.unwrap();
        assert_eq!(store.load("guid").await.unwrap().data, "body");
    }
}
