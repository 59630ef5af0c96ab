//! The versioned snapshot store contract.
//!
//! Every storage backend persists, per job fingerprint ("guid"), an ordered
//! history of [`Snapshot`]s and exposes the same staged-write semantics: a
//! [`Store::save`] is invisible to [`Store::load`] and [`Store::history`]
//! until [`Store::commit`] publishes the whole staged run atomically. This is
//! what lets an interrupted run leave the committed history untouched.
//!
//! Backends ship in separate crates (`snapwatch-sqlite`, `snapwatch-redis`)
//! or, for the in-memory and flat-file engines, in [`memory`] and [`flatfile`].
use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod flatfile;
pub mod memory;
pub mod testing;

/// One persisted observation for a fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The observed payload, typically filtered page text.
    pub data: String,
    /// Seconds since the Unix epoch. `0` is a valid sentinel meaning "no
    /// reliable timestamp" and must not be read as absence of history.
    pub timestamp: i64,
    /// Consecutive-failure counter as stored. Reset to 0 on any success.
    pub tries: u32,
    /// Opaque cache validator (e.g. an HTTP ETag), possibly empty.
    pub etag: String,
}

impl Snapshot {
    pub fn new(data: impl Into<String>, timestamp: i64, tries: u32, etag: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            timestamp,
            tries,
            etag: etag.into(),
        }
    }

    /// Whether this snapshot represents a prior observation.
    ///
    /// A zero-value snapshot (returned by [`Store::load`] for an unknown
    /// fingerprint) does not; a snapshot with empty data but a real timestamp
    /// does.
    pub fn exists(&self) -> bool {
        !self.data.is_empty() || self.timestamp != 0
    }
}

/// The backend-agnostic snapshot store contract.
///
/// The scheduler and classifier depend only on this trait, never on a
/// concrete backend. Implementations must serialize concurrent [`Store::save`]
/// calls internally; callers never lock the store explicitly.
#[async_trait]
pub trait Store: Clone + Send + Sync {
    /// Returns the most recent committed snapshot for `guid`, or a zero-value
    /// snapshot if none exists. Never fails for an unknown fingerprint.
    async fn load(&self, guid: &str) -> Result<Snapshot, StoreError>;

    /// Appends a snapshot to the staging area for `guid`.
    ///
    /// Staged rows are not visible to [`Store::load`] or [`Store::history`]
    /// until [`Store::commit`]. Multiple saves for one guid within a staged
    /// run are all retained; the retention limit is applied at commit time.
    async fn save(&self, guid: &str, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Returns up to `count` (`None` = all) committed snapshots of successful
    /// runs for `guid`, most recent first, deduplicated by content (keeping
    /// the most recent occurrence's metadata).
    ///
    /// Entries saved with `tries > 0` re-persist old data after a failure and
    /// are skipped so the history reflects distinct observed states.
    async fn history(&self, guid: &str, count: Option<usize>) -> Result<Vec<Snapshot>, StoreError>;

    /// All fingerprints with at least one committed snapshot.
    async fn guids(&self) -> Result<HashSet<String>, StoreError>;

    /// Removes all committed history for one fingerprint.
    async fn delete(&self, guid: &str) -> Result<(), StoreError>;

    /// Removes and returns only the most recent committed snapshot, or `None`
    /// when there is nothing to delete. Used by rollback/undo tooling.
    async fn delete_latest(&self, guid: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Atomically publishes all staged rows, then trims each fingerprint's
    /// history to the configured retention limit (oldest evicted first).
    ///
    /// When `delete_staged` is true the staging area is cleared afterwards.
    async fn commit(&self, delete_staged: bool) -> Result<(), StoreError>;

    /// Discards staged rows without ever making them visible.
    async fn rollback(&self) -> Result<(), StoreError>;

    /// Deletes all history for fingerprints not in `known_guids` and trims
    /// each remaining fingerprint's history to `keep` entries.
    async fn gc(&self, known_guids: &HashSet<String>, keep: usize) -> Result<(), StoreError>;

    /// Releases underlying resources. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Failures raised by storage backends. Fatal to a run: the caller must leave
/// the stage uncommitted for diagnosis.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store in bad state")]
    BadState,
    #[error("snapshot i/o failed")]
    Io(#[from] std::io::Error),
    #[error("error encoding or decoding snapshot")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Deduplicate an already most-recent-first snapshot sequence by content,
/// keeping only successful entries, capped at `count`.
///
/// Shared by backends whose native read returns the raw row sequence.
pub fn dedup_history(
    rows: impl IntoIterator<Item = Snapshot>,
    count: Option<usize>,
) -> Vec<Snapshot> {
    if count == Some(0) {
        return Vec::new();
    }
    let mut history: Vec<Snapshot> = Vec::new();
    for snapshot in rows {
        if snapshot.tries != 0 {
            continue;
        }
        if history.iter().any(|kept| kept.data == snapshot.data) {
            continue;
        }
        history.push(snapshot);
        if count.is_some_and(|count| history.len() >= count) {
            break;
        }
    }
    history
}
