//! Test suite for ensuring a correct implementation of a [`Store`].
//!
//! Backend implementors should include this as part of their test suites via
//! [`crate::store_test_suite`]. The suite assumes the store under test is
//! constructed with a retention limit of 4 snapshots per fingerprint.
use std::collections::HashSet;

use super::{Snapshot, Store};

/// Create the contract test suite for a snapwatch store backend.
///
/// # Example
///
/// ```
/// use snapwatch::store_test_suite;
/// use snapwatch::store::memory::MemoryStore;
/// store_test_suite!(for: MemoryStore::new().with_max_snapshots(4));
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        store_test_suite!(attr: tokio::test, store: $store);
    };
    (attr: $attr:meta, store: $store:expr) => {
        #[$attr]
        async fn load_unknown_guid_returns_zero_value() {
            $crate::store::testing::load_unknown_guid_returns_zero_value($store).await;
        }
        #[$attr]
        async fn save_is_invisible_until_commit() {
            $crate::store::testing::save_is_invisible_until_commit($store).await;
        }
        #[$attr]
        async fn commit_publishes_all_staged_rows() {
            $crate::store::testing::commit_publishes_all_staged_rows($store).await;
        }
        #[$attr]
        async fn rollback_never_publishes() {
            $crate::store::testing::rollback_never_publishes($store).await;
        }
        #[$attr]
        async fn history_is_most_recent_first_and_deduplicated() {
            $crate::store::testing::history_is_most_recent_first_and_deduplicated($store).await;
        }
        #[$attr]
        async fn retention_limit_evicts_oldest_at_commit() {
            $crate::store::testing::retention_limit_evicts_oldest_at_commit($store).await;
        }
        #[$attr]
        async fn delete_removes_all_history_for_one_guid() {
            $crate::store::testing::delete_removes_all_history_for_one_guid($store).await;
        }
        #[$attr]
        async fn delete_latest_removes_only_most_recent() {
            $crate::store::testing::delete_latest_removes_only_most_recent($store).await;
        }
        #[$attr]
        async fn gc_drops_unknown_guids_and_trims_the_rest() {
            $crate::store::testing::gc_drops_unknown_guids_and_trims_the_rest($store).await;
        }
        #[$attr]
        async fn close_is_idempotent() {
            $crate::store::testing::close_is_idempotent($store).await;
        }
    };
}

async fn commit_one(store: &impl Store, guid: &str, snapshot: Snapshot) {
    store.save(guid, snapshot).await.unwrap();
    store.commit(true).await.unwrap();
}

pub async fn load_unknown_guid_returns_zero_value(store: impl Store) {
    let snapshot = store.load("never-seen").await.unwrap();
    assert_eq!(snapshot, Snapshot::default());
    assert!(!snapshot.exists());
    assert!(store.history("never-seen", None).await.unwrap().is_empty());
}

pub async fn save_is_invisible_until_commit(store: impl Store) {
    store
        .save("guid", Snapshot::new("body", 100, 0, "etag"))
        .await
        .unwrap();
    assert!(!store.load("guid").await.unwrap().exists());
    assert!(store.history("guid", None).await.unwrap().is_empty());
    assert!(store.guids().await.unwrap().is_empty());
}

pub async fn commit_publishes_all_staged_rows(store: impl Store) {
    store.save("a", Snapshot::new("one", 100, 0, "")).await.unwrap();
    store.save("a", Snapshot::new("two", 200, 0, "")).await.unwrap();
    store.save("b", Snapshot::new("three", 300, 0, "")).await.unwrap();
    store.commit(true).await.unwrap();

    assert_eq!(store.load("a").await.unwrap().data, "two");
    assert_eq!(store.load("b").await.unwrap().data, "three");
    let history = store.history("a", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].data, "two");
    assert_eq!(history[1].data, "one");

    // The stage was cleared, so another commit publishes nothing new.
    store.commit(true).await.unwrap();
    assert_eq!(store.history("a", None).await.unwrap().len(), 2);
}

pub async fn rollback_never_publishes(store: impl Store) {
    store.save("guid", Snapshot::new("body", 100, 0, "")).await.unwrap();
    store.rollback().await.unwrap();
    store.commit(true).await.unwrap();
    assert!(!store.load("guid").await.unwrap().exists());
}

pub async fn history_is_most_recent_first_and_deduplicated(store: impl Store) {
    commit_one(&store, "guid", Snapshot::new("alpha", 100, 0, "e1")).await;
    commit_one(&store, "guid", Snapshot::new("beta", 200, 0, "e2")).await;
    // A failure run re-saves old data with tries > 0; skipped from history.
    commit_one(&store, "guid", Snapshot::new("beta", 300, 1, "e2")).await;
    commit_one(&store, "guid", Snapshot::new("alpha", 400, 0, "e3")).await;

    let history = store.history("guid", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].data, "alpha");
    assert_eq!(history[0].etag, "e3");
    assert_eq!(history[1].data, "beta");
    assert_eq!(history[1].timestamp, 200);

    assert_eq!(store.history("guid", Some(1)).await.unwrap().len(), 1);
    assert!(store.history("guid", Some(0)).await.unwrap().is_empty());
}

pub async fn retention_limit_evicts_oldest_at_commit(store: impl Store) {
    for run in 1..=6i64 {
        commit_one(&store, "guid", Snapshot::new(format!("v{run}"), run * 100, 0, "")).await;
    }
    let history = store.history("guid", None).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].data, "v6");
    assert_eq!(history[3].data, "v3");
}

pub async fn delete_removes_all_history_for_one_guid(store: impl Store) {
    commit_one(&store, "gone", Snapshot::new("x", 100, 0, "")).await;
    commit_one(&store, "kept", Snapshot::new("y", 100, 0, "")).await;
    store.delete("gone").await.unwrap();
    assert!(!store.load("gone").await.unwrap().exists());
    assert_eq!(store.load("kept").await.unwrap().data, "y");
}

pub async fn delete_latest_removes_only_most_recent(store: impl Store) {
    assert_eq!(store.delete_latest("guid").await.unwrap(), None);

    commit_one(&store, "guid", Snapshot::new("old", 100, 0, "")).await;
    commit_one(&store, "guid", Snapshot::new("new", 200, 0, "")).await;

    let removed = store.delete_latest("guid").await.unwrap().unwrap();
    assert_eq!(removed.data, "new");
    assert_eq!(store.load("guid").await.unwrap().data, "old");
}

pub async fn gc_drops_unknown_guids_and_trims_the_rest(store: impl Store) {
    commit_one(&store, "orphan", Snapshot::new("x", 100, 0, "")).await;
    commit_one(&store, "tracked", Snapshot::new("one", 100, 0, "")).await;
    commit_one(&store, "tracked", Snapshot::new("two", 200, 0, "")).await;

    let known = HashSet::from(["tracked".to_owned()]);
    store.gc(&known, 1).await.unwrap();

    assert_eq!(store.guids().await.unwrap(), known);
    let history = store.history("tracked", None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].data, "two");
}

pub async fn close_is_idempotent(store: impl Store) {
    store.close().await.unwrap();
    store.close().await.unwrap();
}
