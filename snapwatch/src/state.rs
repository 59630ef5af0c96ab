//! Per-job, per-run ephemeral state.
use crate::{job::FetchError, store::Snapshot};

/// The classification outcome of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    New,
    Unchanged,
    Changed,
    Error,
}

/// Everything observed while running one job, folded into the report at the
/// end of processing.
///
/// Exclusively owned by the worker executing the job; never shared across
/// workers.
#[derive(Debug, Clone)]
pub struct JobState {
    /// 1-based display index of the originating job.
    pub index_number: usize,
    /// The job's fingerprint (snapshot-store key).
    pub guid: String,
    pub verb: Verb,
    /// The comparison baseline: the most recent persisted snapshot, possibly
    /// replaced by a closer fuzzy match during classification.
    pub old: Snapshot,
    pub new_data: String,
    pub new_timestamp: i64,
    pub new_etag: String,
    /// The fetch error, if any; present for error and not-modified runs.
    pub error: Option<FetchError>,
    /// This run's consecutive-failure counter, seeded from the stored
    /// snapshot and persisted back with the run's save.
    pub tries: u32,
}
