//! The scheduler that drives the whole job set to completion.
//!
//! Jobs run in two sequential phases: non-browser jobs first, browser jobs
//! second, each phase through a bounded worker pool. Browser automation is
//! far more resource-hungry (one renderer process per concurrent job), so
//! its pool is sized from a live memory probe instead of contending with the
//! cheap phase.
//!
//! Within a phase, outcomes are collected in original job-list order
//! regardless of completion order. The scheduler never commits the snapshot
//! store: the caller commits after a full run and rolls back otherwise, so
//! an interrupted run leaves nothing half-written.
use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};

use crate::{
    classify::{classify, Disposition},
    job::{Job, JobDefaults},
    probe::{MemoryProbe, SystemMemoryProbe},
    report::{ReportSink, RunReport},
    state::{JobState, Verb},
    store::{Snapshot, Store},
    RunError,
};

/// Memory budget per concurrent browser job when sizing the phase-2 pool.
const BROWSER_JOB_MEMORY_BUDGET: u64 = 200_000_000;

/// An optional best-effort check for a newer release of the host
/// application, raced against the run and read without waiting.
#[async_trait::async_trait]
pub trait ReleaseCheck: Send + Sync {
    async fn latest_release(&self) -> Option<String>;
}

/// Run-level configuration for the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Explicit worker-pool size for both phases. When unset, phase 1 is
    /// unconstrained and phase 2 is sized from the memory probe.
    pub max_workers: Option<usize>,
    /// Defaults folded into each job via [`Job::with_defaults`].
    pub defaults: JobDefaults,
}

/// Executes a job list against a snapshot store and aggregates the outcome.
pub struct Scheduler<S> {
    store: S,
    config: RunConfig,
    probe: Arc<dyn MemoryProbe>,
    release_check: Option<Arc<dyn ReleaseCheck>>,
}

impl<S> Scheduler<S>
where
    S: Store,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: RunConfig::default(),
            probe: Arc::new(SystemMemoryProbe),
            release_check: None,
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_release_check(mut self, release_check: Arc<dyn ReleaseCheck>) -> Self {
        self.release_check = Some(release_check);
        self
    }

    /// The store this scheduler stages writes into. Callers commit through
    /// this handle once the run has fully completed.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the given jobs, optionally restricted to a subset of 1-based
    /// (or negative, counted from the end) display indices.
    ///
    /// Fails with [`RunError::IndexRange`] before any job executes when the
    /// selection is invalid; partial execution on a bad selection is never
    /// acceptable. Per-job fetch failures are contained; store failures
    /// abort the run with the stage left uncommitted.
    pub async fn run(
        &self,
        jobs: &[Arc<dyn Job>],
        selection: Option<&[i64]>,
    ) -> Result<RunReport, RunError> {
        let jobs = select_jobs(jobs, selection, &self.config.defaults)?;
        tracing::debug!(jobs = jobs.len(), "processing jobs");

        let release = self.release_check.as_ref().map(|check| {
            let check = Arc::clone(check);
            tokio::spawn(async move { check.latest_release().await })
        });

        let mut report = RunReport::new();

        let plain: Vec<_> = jobs.iter().filter(|job| !job.is_browser()).cloned().collect();
        if !plain.is_empty() {
            let workers = self.config.max_workers.unwrap_or(plain.len());
            tracing::debug!(jobs = plain.len(), workers, "running non-browser jobs");
            self.run_phase(plain, workers, &mut report).await?;
        }

        let browser: Vec<_> = jobs.iter().filter(|job| job.is_browser()).cloned().collect();
        if !browser.is_empty() {
            let workers = self.browser_workers()?;
            tracing::debug!(jobs = browser.len(), workers, "running browser jobs");
            self.run_phase(browser, workers, &mut report).await?;
        }

        // Read, never await: an unfinished check does not delay the report.
        if let Some(handle) = release {
            if handle.is_finished() {
                report.new_release = handle.await.ok().flatten();
            } else {
                handle.abort();
            }
        }
        report.finish();
        Ok(report)
    }

    /// Runs one phase through a bounded pool, folding outcomes into the
    /// report in original job order (results are joined back to their
    /// originating job, not emitted in completion order).
    async fn run_phase(
        &self,
        jobs: Vec<Arc<dyn Job>>,
        workers: usize,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let outcomes: Vec<(Disposition, JobState)> = stream::iter(jobs)
            .map(|job| self.process(job))
            .buffered(workers.max(1))
            .try_collect()
            .await?;

        for (disposition, state) in outcomes {
            match disposition {
                Disposition::New => report.record_new(state),
                Disposition::Unchanged { .. } => report.record_unchanged(state),
                Disposition::Changed => report.record_changed(state),
                Disposition::Error => report.record_error(state),
                // Below the failure threshold or explicitly ignored: never
                // reported.
                Disposition::Suppressed | Disposition::Ignored => {}
            }
        }
        Ok(())
    }

    /// Drives one job through fetch, classification and the staged save.
    async fn process(
        &self,
        job: Arc<dyn Job>,
    ) -> Result<(Disposition, JobState), RunError> {
        let guid = job.fingerprint();
        tracing::info!(job = job.index_number(), "processing job");

        let old = self.store.load(&guid).await?;
        let history = self.store.history(&guid, None).await?;
        let mut state = JobState {
            index_number: job.index_number(),
            guid: guid.clone(),
            verb: Verb::Unchanged,
            tries: old.tries,
            old,
            new_data: String::new(),
            new_timestamp: Utc::now().timestamp(),
            new_etag: String::new(),
            error: None,
        };

        match job.fetch().await {
            Ok(fetched) => {
                state.new_data = fetched.data;
                state.new_etag = fetched.etag;
                if let Some(timestamp) = fetched.timestamp {
                    state.new_timestamp = timestamp;
                }
            }
            Err(error) => state.error = Some(error),
        }

        let disposition = classify(&mut state, &history, job.max_tries());
        let snapshot = match disposition {
            Disposition::New | Disposition::Changed => Some(Snapshot::new(
                state.new_data.clone(),
                state.new_timestamp,
                state.tries,
                state.new_etag.clone(),
            )),
            // An exact match whose failure counter needs resetting: the
            // fetched body is what the source shows now, so it becomes the
            // latest entry. A 304 carries no body, so the old data is
            // carried forward instead.
            Disposition::Unchanged { resave: true } => Some(if state.error.is_none() {
                Snapshot::new(
                    state.new_data.clone(),
                    state.new_timestamp,
                    state.tries,
                    state.new_etag.clone(),
                )
            } else {
                Snapshot::new(
                    state.old.data.clone(),
                    state.new_timestamp,
                    state.tries,
                    state.old.etag.clone(),
                )
            }),
            // Failed fetches have no usable body: re-save the old data under
            // the incremented counter.
            Disposition::Suppressed | Disposition::Error => Some(Snapshot::new(
                state.old.data.clone(),
                state.new_timestamp,
                state.tries,
                state.old.etag.clone(),
            )),
            Disposition::Unchanged { resave: false } | Disposition::Ignored => None,
        };
        if let Some(snapshot) = snapshot {
            self.store.save(&guid, snapshot).await?;
        }
        Ok((disposition, state))
    }

    fn browser_workers(&self) -> Result<usize, RunError> {
        if let Some(workers) = self.config.max_workers {
            return Ok(workers);
        }
        let available = self.probe.available_memory_bytes()?;
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let workers = ((available / BROWSER_JOB_MEMORY_BUDGET) as usize)
            .max(1)
            .min(cpus);
        tracing::debug!(available, workers, "sized browser pool from available memory");
        Ok(workers)
    }
}

/// Validates and applies the optional index selection, then folds run-level
/// defaults into each job.
///
/// Indices outside `[-n, -1] ∪ [1, n]` fail the entire run up front.
fn select_jobs(
    jobs: &[Arc<dyn Job>],
    selection: Option<&[i64]>,
    defaults: &JobDefaults,
) -> Result<Vec<Arc<dyn Job>>, RunError> {
    let num_jobs = jobs.len();
    let selected = match selection {
        None => None,
        Some(indices) => {
            let bound = num_jobs as i64;
            let mut set = HashSet::new();
            for &index in indices {
                if !((-bound..=-1).contains(&index) || (1..=bound).contains(&index)) {
                    return Err(RunError::IndexRange { index, num_jobs });
                }
                let normalized = if index > 0 { index } else { bound + index + 1 };
                set.insert(normalized as usize);
            }
            tracing::debug!(?set, "running subset of jobs selected by index");
            Some(set)
        }
    };

    Ok(jobs
        .iter()
        .filter(|job| {
            selected
                .as_ref()
                .map_or(true, |set| set.contains(&job.index_number()))
        })
        .map(|job| job.with_defaults(defaults))
        .collect())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        job::{test::MockJob, FetchError, Fetched},
        probe::ProbeError,
        store::memory::MemoryStore,
    };

    struct StubProbe(Result<u64, ()>);

    impl MemoryProbe for StubProbe {
        fn available_memory_bytes(&self) -> Result<u64, ProbeError> {
            self.0
                .map_err(|_| ProbeError::Unavailable("stubbed".to_owned()))
        }
    }

    struct StubReleaseCheck {
        version: &'static str,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ReleaseCheck for StubReleaseCheck {
        async fn latest_release(&self) -> Option<String> {
            tokio::time::sleep(self.delay).await;
            Some(self.version.to_owned())
        }
    }

    fn scheduler(store: MemoryStore) -> Scheduler<MemoryStore> {
        Scheduler::new(store).with_probe(Arc::new(StubProbe(Ok(1_000_000_000))))
    }

    fn verbs(report: &RunReport) -> Vec<(usize, Verb)> {
        report
            .job_states()
            .iter()
            .map(|state| (state.index_number, state.verb))
            .collect()
    }

    #[tokio::test]
    async fn first_observation_then_unchanged_then_changed() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());

        // Run 1: never seen before.
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::New)]);
        store.commit(true).await.unwrap();
        let first = store.load("job-a").await.unwrap();
        assert_eq!((first.data.as_str(), first.tries), ("X", 0));

        // Run 2: identical data.
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::Unchanged)]);
        assert_eq!(report.job_states()[0].tries, 0);
        store.commit(true).await.unwrap();
        // No resave for a clean unchanged run: history stays at one entry.
        assert_eq!(store.history("job-a", None).await.unwrap().len(), 1);

        // Run 3: new data diffs against the stored snapshot.
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("Y")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::Changed)]);
        assert_eq!(report.job_states()[0].old.data, "X");
        store.commit(true).await.unwrap();
        assert_eq!(store.load("job-a").await.unwrap().data, "Y");
    }

    #[tokio::test]
    async fn outcomes_keep_job_order_despite_completion_order() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![
            MockJob::new("slow", 1)
                .with_delay(Duration::from_millis(50))
                .returning(Ok(Fetched::new("slow body")))
                .into_job(),
            MockJob::new("fast", 2)
                .returning(Ok(Fetched::new("fast body")))
                .into_job(),
        ];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::New), (2, Verb::New)]);
    }

    #[tokio::test]
    async fn browser_jobs_run_in_second_phase() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![
            MockJob::new("browser", 1)
                .browser()
                .returning(Ok(Fetched::new("rendered")))
                .into_job(),
            MockJob::new("plain", 2)
                .returning(Ok(Fetched::new("plain body")))
                .into_job(),
        ];
        let report = scheduler.run(&jobs, None).await.unwrap();
        // The non-browser job is reported first even though it is listed
        // second.
        assert_eq!(verbs(&report), vec![(2, Verb::New), (1, Verb::New)]);
    }

    #[tokio::test]
    async fn invalid_index_selection_fails_before_any_side_effect() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        let error = scheduler.run(&jobs, Some(&[999])).await.unwrap_err();
        assert_matches!(
            error,
            RunError::IndexRange {
                index: 999,
                num_jobs: 1
            }
        );
        store.commit(true).await.unwrap();
        assert!(store.guids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_indices_count_from_the_end() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![
            MockJob::new("first", 1)
                .returning(Ok(Fetched::new("one")))
                .into_job(),
            MockJob::new("last", 2)
                .returning(Ok(Fetched::new("two")))
                .into_job(),
        ];
        let report = scheduler.run(&jobs, Some(&[-1])).await.unwrap();
        assert_eq!(verbs(&report), vec![(2, Verb::New)]);
    }

    #[tokio::test]
    async fn suppressed_failure_persists_counter_without_reporting() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());

        let jobs = vec![MockJob::new("job-a", 1)
            .with_max_tries(3)
            .returning(Ok(Fetched::new("good").with_etag("etag")))
            .into_job()];
        scheduler.run(&jobs, None).await.unwrap();
        store.commit(true).await.unwrap();

        let jobs = vec![MockJob::new("job-a", 1)
            .with_max_tries(3)
            .returning(Err(FetchError::Failed("connection refused".to_owned())))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert!(report.job_states().is_empty());
        store.commit(true).await.unwrap();

        let latest = store.load("job-a").await.unwrap();
        assert_eq!(latest.tries, 1);
        // The old data and validator are carried forward.
        assert_eq!(latest.data, "good");
        assert_eq!(latest.etag, "etag");
    }

    #[tokio::test]
    async fn failure_streak_surfaces_error_at_threshold() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());

        for run in 1..=3u32 {
            let jobs = vec![MockJob::new("job-a", 1)
                .with_max_tries(3)
                .returning(Err(FetchError::Failed("boom".to_owned())))
                .into_job()];
            let report = scheduler.run(&jobs, None).await.unwrap();
            store.commit(true).await.unwrap();
            if run < 3 {
                assert!(report.job_states().is_empty(), "run {run} must be silent");
            } else {
                assert_eq!(verbs(&report), vec![(1, Verb::Error)]);
            }
            assert_eq!(store.load("job-a").await.unwrap().tries, run);
        }
    }

    #[tokio::test]
    async fn zero_max_tries_reports_first_failure() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Err(FetchError::Failed("boom".to_owned())))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::Error)]);
    }

    #[tokio::test]
    async fn default_max_tries_applies_to_jobs_without_their_own() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone()).with_config(RunConfig {
            max_workers: None,
            defaults: JobDefaults { max_tries: Some(5) },
        });
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Err(FetchError::Failed("boom".to_owned())))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        // Suppressed under the default threshold instead of erroring.
        assert!(report.job_states().is_empty());
    }

    #[tokio::test]
    async fn ignored_errors_leave_no_trace() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Err(FetchError::Ignored("timeout".to_owned())))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert!(report.job_states().is_empty());
        store.commit(true).await.unwrap();
        assert!(store.guids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_modified_reports_unchanged() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());

        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        scheduler.run(&jobs, None).await.unwrap();
        store.commit(true).await.unwrap();

        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Err(FetchError::NotModified))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::Unchanged)]);
        store.commit(true).await.unwrap();
        // A clean counter means nothing new was written.
        assert_eq!(store.history("job-a", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revert_after_failure_persists_the_fetched_data() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());

        // Establish history "A" then "B".
        for data in ["A", "B"] {
            let jobs = vec![MockJob::new("job-a", 1)
                .returning(Ok(Fetched::new(data)))
                .into_job()];
            scheduler.run(&jobs, None).await.unwrap();
            store.commit(true).await.unwrap();
        }

        // A failing run re-saves "B" with a dirty counter.
        let jobs = vec![MockJob::new("job-a", 1)
            .with_max_tries(3)
            .returning(Err(FetchError::Failed("boom".to_owned())))
            .into_job()];
        scheduler.run(&jobs, None).await.unwrap();
        store.commit(true).await.unwrap();
        assert_eq!(store.load("job-a").await.unwrap().tries, 1);

        // The source reverts to "A", an exact match deeper in history. The
        // save that clears the counter must carry the fetched body, not the
        // stale "B" baseline.
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("A").with_etag("etag-a")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(verbs(&report), vec![(1, Verb::Unchanged)]);
        store.commit(true).await.unwrap();

        let latest = store.load("job-a").await.unwrap();
        assert_eq!(latest.data, "A");
        assert_eq!(latest.etag, "etag-a");
        assert_eq!(latest.tries, 0);
    }

    #[tokio::test]
    async fn probe_failure_is_fatal_only_with_browser_jobs() {
        let store = MemoryStore::new();
        let broken = Scheduler::new(store.clone()).with_probe(Arc::new(StubProbe(Err(()))));

        let plain = vec![MockJob::new("plain", 1)
            .returning(Ok(Fetched::new("body")))
            .into_job()];
        assert!(broken.run(&plain, None).await.is_ok());

        let browser = vec![MockJob::new("browser", 1)
            .browser()
            .returning(Ok(Fetched::new("rendered")))
            .into_job()];
        assert_matches!(
            broken.run(&browser, None).await,
            Err(RunError::Probe(ProbeError::Unavailable(_)))
        );
    }

    #[tokio::test]
    async fn explicit_worker_override_skips_the_probe() {
        let store = MemoryStore::new();
        let scheduler = Scheduler::new(store.clone())
            .with_probe(Arc::new(StubProbe(Err(()))))
            .with_config(RunConfig {
                max_workers: Some(2),
                defaults: JobDefaults::default(),
            });
        let jobs = vec![MockJob::new("browser", 1)
            .browser()
            .returning(Ok(Fetched::new("rendered")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(report.count(Verb::New), 1);
    }

    #[tokio::test]
    async fn unfinished_release_check_never_delays_the_report() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone()).with_release_check(Arc::new(StubReleaseCheck {
            version: "9.9.9",
            delay: Duration::from_secs(3600),
        }));
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(report.new_release, None);
        assert!(report.duration() < Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_release_check_lands_in_the_report() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone()).with_release_check(Arc::new(StubReleaseCheck {
            version: "9.9.9",
            delay: Duration::ZERO,
        }));
        let jobs = vec![MockJob::new("job-a", 1)
            .with_delay(Duration::from_millis(100))
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        let report = scheduler.run(&jobs, None).await.unwrap();
        assert_eq!(report.new_release.as_deref(), Some("9.9.9"));
    }

    #[tokio::test]
    async fn staged_writes_stay_invisible_until_caller_commits() {
        let store = MemoryStore::new();
        let scheduler = scheduler(store.clone());
        let jobs = vec![MockJob::new("job-a", 1)
            .returning(Ok(Fetched::new("X")))
            .into_job()];
        scheduler.run(&jobs, None).await.unwrap();
        assert!(!store.load("job-a").await.unwrap().exists());
        store.rollback().await.unwrap();
        store.commit(true).await.unwrap();
        assert!(!store.load("job-a").await.unwrap().exists());
    }
}
