//! The interface jobs expose to the engine.
//!
//! Parsing job definitions and the actual fetch mechanics (HTTP, shell,
//! headless browser) live with the collaborator implementing [`Job`]; the
//! scheduler only drives `fetch` and classifies its result.
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// An immutable-per-run description of one monitored source.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identity derived from the job-defining fields (not the index).
    /// Used as the snapshot-store key.
    fn fingerprint(&self) -> String;

    /// 1-based position in the active job list, used only for display and
    /// selection.
    fn index_number(&self) -> usize;

    /// Consecutive-failure threshold for the retry policy. `0` means "report
    /// on the first error".
    fn max_tries(&self) -> u32 {
        0
    }

    /// Browser-driven jobs run in the second, memory-bounded phase.
    fn is_browser(&self) -> bool {
        false
    }

    /// Returns this job with run-level configuration defaults folded in.
    fn with_defaults(&self, defaults: &JobDefaults) -> Arc<dyn Job>;

    /// Fetches the source once. May take as long as it needs (network I/O,
    /// subprocess wait, browser round-trip); the scheduler never retries
    /// within a run.
    async fn fetch(&self) -> Result<Fetched, FetchError>;
}

/// Run-level defaults applied to every job before execution.
#[derive(Debug, Clone, Default)]
pub struct JobDefaults {
    /// Default failure threshold for jobs that do not set their own.
    pub max_tries: Option<u32>,
}

/// The result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub data: String,
    /// Source-provided observation time (e.g. a Last-Modified header); when
    /// `None` the scheduler stamps the fetch with the current time.
    pub timestamp: Option<i64>,
    pub etag: String,
}

impl Fetched {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            timestamp: None,
            etag: String::new(),
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }
}

/// Failures a fetch can raise. Contained per job: they never abort the pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The source reported no change (HTTP 304 or an identical strong
    /// validator). Not a failure: classified as unchanged.
    #[error("resource not modified")]
    NotModified,
    /// The job's own configuration says to ignore this error. Logged only;
    /// neither persisted nor reported.
    #[error("error ignored by job configuration: {0}")]
    Ignored(String),
    /// A transient fetch failure, subject to the retry policy.
    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    /// A job returning a scripted sequence of fetch results, one per run.
    pub(crate) struct MockJob {
        fingerprint: String,
        index_number: usize,
        max_tries: u32,
        is_browser: bool,
        delay: Duration,
        results: Arc<Mutex<VecDeque<Result<Fetched, FetchError>>>>,
    }

    impl MockJob {
        pub(crate) fn new(fingerprint: impl Into<String>, index_number: usize) -> Self {
            Self {
                fingerprint: fingerprint.into(),
                index_number,
                max_tries: 0,
                is_browser: false,
                delay: Duration::ZERO,
                results: Default::default(),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn with_max_tries(mut self, max_tries: u32) -> Self {
            self.max_tries = max_tries;
            self
        }

        pub(crate) fn browser(mut self) -> Self {
            self.is_browser = true;
            self
        }

        pub(crate) fn returning(self, result: Result<Fetched, FetchError>) -> Self {
            self.results.lock().unwrap().push_back(result);
            self
        }

        pub(crate) fn into_job(self) -> Arc<dyn Job> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl Job for MockJob {
        fn fingerprint(&self) -> String {
            self.fingerprint.clone()
        }

        fn index_number(&self) -> usize {
            self.index_number
        }

        fn max_tries(&self) -> u32 {
            self.max_tries
        }

        fn is_browser(&self) -> bool {
            self.is_browser
        }

        fn with_defaults(&self, defaults: &JobDefaults) -> Arc<dyn Job> {
            Arc::new(Self {
                fingerprint: self.fingerprint.clone(),
                index_number: self.index_number,
                max_tries: match self.max_tries {
                    0 => defaults.max_tries.unwrap_or(0),
                    max_tries => max_tries,
                },
                is_browser: self.is_browser,
                delay: self.delay,
                results: Arc::clone(&self.results),
            })
        }

        async fn fetch(&self) -> Result<Fetched, FetchError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Failed("no scripted result".to_owned())))
        }
    }
}
