//! SQLite-backed snapshot store.
//!
//! Committed history lives in a single on-disk database; staged writes go to
//! a separate in-memory database with the same schema and are copied over in
//! one transaction at commit time. An interrupted run therefore never
//! touches the on-disk file.
use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use snapwatch::store::{dedup_history, Snapshot, Store, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        guid      TEXT    NOT NULL,
        timestamp INTEGER NOT NULL,
        data      TEXT    NOT NULL,
        tries     INTEGER NOT NULL,
        etag      TEXT    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_snapshots_guid ON snapshots (guid, timestamp);
";

/// A [`Store`] persisting snapshot history in a SQLite database file.
///
/// Clones share the same connections and the same staging area.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Mutex<Connection>,
    staged: Mutex<Connection>,
    max_snapshots: usize,
}

fn map_err(error: rusqlite::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot::new(
        row.get::<_, String>(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, String>(3)?,
    ))
}

impl SqliteStore {
    /// Opens (creating if necessary) the database at `path`.
    ///
    /// `max_snapshots` is the per-fingerprint retention limit applied at
    /// commit time; `0` keeps everything.
    pub fn open(path: impl AsRef<Path>, max_snapshots: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path).map_err(map_err)?, max_snapshots)
    }

    /// Opens a store backed entirely by in-memory databases. History does
    /// not survive the process; useful for tests and dry runs.
    pub fn open_in_memory(max_snapshots: usize) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(map_err)?, max_snapshots)
    }

    fn from_connection(db: Connection, max_snapshots: usize) -> Result<Self, StoreError> {
        let staged = Connection::open_in_memory().map_err(map_err)?;
        db.execute_batch(SCHEMA).map_err(map_err)?;
        staged.execute_batch(SCHEMA).map_err(map_err)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                staged: Mutex::new(staged),
                max_snapshots,
            }),
        })
    }
}

impl Inner {
    fn db(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::BadState)
    }

    fn staged(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.staged.lock().map_err(|_| StoreError::BadState)
    }

    fn trim_to_limit(db: &Connection, keep: usize) -> Result<(), StoreError> {
        db.execute(
            "DELETE FROM snapshots
            WHERE rowid IN (
                SELECT rowid FROM (
                    SELECT rowid, ROW_NUMBER() OVER (
                        PARTITION BY guid ORDER BY timestamp DESC, rowid DESC
                    ) AS rank
                    FROM snapshots
                )
                WHERE rank > ?1
            )",
            params![keep as i64],
        )
        .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load(&self, guid: &str) -> Result<Snapshot, StoreError> {
        let db = self.inner.db()?;
        db.query_row(
            "SELECT data, timestamp, tries, etag FROM snapshots
            WHERE guid = ?1
            ORDER BY timestamp DESC, rowid DESC
            LIMIT 1",
            params![guid],
            snapshot_from_row,
        )
        .optional()
        .map_err(map_err)
        .map(Option::unwrap_or_default)
    }

    async fn save(&self, guid: &str, snapshot: Snapshot) -> Result<(), StoreError> {
        let staged = self.inner.staged()?;
        staged
            .execute(
                "INSERT INTO snapshots (guid, timestamp, data, tries, etag)
                VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    guid,
                    snapshot.timestamp,
                    snapshot.data,
                    snapshot.tries,
                    snapshot.etag
                ],
            )
            .map_err(map_err)?;
        Ok(())
    }

    async fn history(&self, guid: &str, count: Option<usize>) -> Result<Vec<Snapshot>, StoreError> {
        let db = self.inner.db()?;
        let mut statement = db
            .prepare(
                "SELECT data, timestamp, tries, etag FROM snapshots
                WHERE guid = ?1
                ORDER BY timestamp DESC, rowid DESC",
            )
            .map_err(map_err)?;
        let rows = statement
            .query_map(params![guid], snapshot_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(dedup_history(rows, count))
    }

    async fn guids(&self) -> Result<HashSet<String>, StoreError> {
        let db = self.inner.db()?;
        let mut statement = db
            .prepare("SELECT DISTINCT guid FROM snapshots")
            .map_err(map_err)?;
        let guids = statement
            .query_map([], |row| row.get(0))
            .map_err(map_err)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(map_err);
        guids
    }

    async fn delete(&self, guid: &str) -> Result<(), StoreError> {
        let db = self.inner.db()?;
        db.execute("DELETE FROM snapshots WHERE guid = ?1", params![guid])
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete_latest(&self, guid: &str) -> Result<Option<Snapshot>, StoreError> {
        let db = self.inner.db()?;
        let latest = db
            .query_row(
                "SELECT rowid, data, timestamp, tries, etag FROM snapshots
                WHERE guid = ?1
                ORDER BY timestamp DESC, rowid DESC
                LIMIT 1",
                params![guid],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        Snapshot::new(
                            row.get::<_, String>(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get::<_, String>(4)?,
                        ),
                    ))
                },
            )
            .optional()
            .map_err(map_err)?;
        match latest {
            Some((rowid, snapshot)) => {
                db.execute("DELETE FROM snapshots WHERE rowid = ?1", params![rowid])
                    .map_err(map_err)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, delete_staged: bool) -> Result<(), StoreError> {
        let staged = self.inner.staged()?;
        let rows = {
            let mut statement = staged
                .prepare(
                    "SELECT guid, timestamp, data, tries, etag FROM snapshots
                    ORDER BY rowid",
                )
                .map_err(map_err)?;
            let rows = statement
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(map_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_err)?;
            rows
        };
        tracing::debug!(rows = rows.len(), "publishing staged snapshots");

        let mut db = self.inner.db()?;
        let tx = db.transaction().map_err(map_err)?;
        for (guid, timestamp, data, tries, etag) in &rows {
            tx.execute(
                "INSERT INTO snapshots (guid, timestamp, data, tries, etag)
                VALUES (?1, ?2, ?3, ?4, ?5)",
                params![guid, timestamp, data, tries, etag],
            )
            .map_err(map_err)?;
        }
        if self.inner.max_snapshots > 0 {
            Inner::trim_to_limit(&tx, self.inner.max_snapshots)?;
        }
        tx.commit().map_err(map_err)?;

        if delete_staged {
            staged
                .execute("DELETE FROM snapshots", [])
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let staged = self.inner.staged()?;
        let dropped = staged
            .execute("DELETE FROM snapshots", [])
            .map_err(map_err)?;
        tracing::debug!(rows = dropped, "discarded staged snapshots");
        Ok(())
    }

    async fn gc(&self, known_guids: &HashSet<String>, keep: usize) -> Result<(), StoreError> {
        let stored = self.guids().await?;
        let db = self.inner.db()?;
        for guid in stored.difference(known_guids) {
            tracing::debug!(%guid, "deleting history for unknown fingerprint");
            db.execute("DELETE FROM snapshots WHERE guid = ?1", params![guid])
                .map_err(map_err)?;
        }
        if keep > 0 {
            Inner::trim_to_limit(&db, keep)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let db = self.inner.db()?;
        db.execute_batch("VACUUM").map_err(map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use snapwatch::store_test_suite;

    store_test_suite!(for: SqliteStore::open_in_memory(4).unwrap());

    #[tokio::test]
    async fn data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");

        let store = SqliteStore::open(&path, 0).unwrap();
        store
            .save("guid", Snapshot::new("body", 100, 0, "etag"))
            .await
            .unwrap();
        store.commit(true).await.unwrap();
        store.close().await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path, 0).unwrap();
        let snapshot = reopened.load("guid").await.unwrap();
        assert_eq!(snapshot.data, "body");
        assert_eq!(snapshot.etag, "etag");
    }

    #[tokio::test]
    async fn commit_without_clearing_stage_replays_on_next_commit() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .save("guid", Snapshot::new("body", 100, 0, ""))
            .await
            .unwrap();
        store.commit(false).await.unwrap();
        store.commit(true).await.unwrap();

        let db = store.inner.db().unwrap();
        let rows: i64 = db
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn clones_share_the_staging_area() {
        let store = SqliteStore::open_in_memory(0).unwrap();
        store
            .clone()
            .save("guid", Snapshot::new("body", 100, 0, ""))
            .await
            .unwrap();
        store.commit(true).await.unwrap();
        assert_eq!(store.load("guid").await.unwrap().data, "body");
    }
}
