//! A change-monitoring engine: run a set of fetch jobs concurrently,
//! classify each result against its stored history, and stage the new
//! snapshots in a versioned store that only becomes visible on commit.
//!
//! The crate is built around three seams:
//!
//! - [`job::Job`]: what to fetch. Implementations own the fetch mechanics
//!   (HTTP, shell, headless browser); the engine only drives them.
//! - [`store::Store`]: where snapshots live. Backends stage writes during a
//!   run and publish them atomically on [`store::Store::commit`]. An
//!   in-memory and a flat-file backend ship here; SQLite and Redis backends
//!   live in their own crates.
//! - [`scheduler::Scheduler`]: the engine itself. Non-browser jobs run
//!   first through one worker pool, browser jobs second through a pool
//!   sized from available memory, and outcomes land in a [`report::RunReport`]
//!   in original job order.
//!
//! ```
//! # use std::sync::Arc;
//! # use snapwatch::prelude::*;
//! # use snapwatch::store::memory::MemoryStore;
//! # async fn example(jobs: Vec<Arc<dyn Job>>) -> Result<(), snapwatch::RunError> {
//! let store = MemoryStore::new().with_max_snapshots(10);
//! let scheduler = Scheduler::new(store.clone());
//! let report = scheduler.run(&jobs, None).await?;
//! store.commit(true).await?;
//! println!("{} changed", report.count(Verb::Changed));
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod classify;
pub mod job;
pub mod prelude;
pub mod probe;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;

/// Failures that abort an entire run.
///
/// Per-job fetch errors are never surfaced here: they are contained and
/// classified. Only a bad job selection or an infrastructure failure (the
/// store, the memory probe) stops the run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("job index {index} out of range (found {num_jobs} jobs)")]
    IndexRange { index: i64, num_jobs: usize },
    #[error("snapshot store error: {0}")]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Probe(#[from] probe::ProbeError),
}
