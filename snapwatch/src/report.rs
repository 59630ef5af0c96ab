//! Aggregation of per-job outcomes for the reporting layer.
use std::time::{Duration, Instant};

use crate::state::{JobState, Verb};

/// The sink the scheduler folds job outcomes into, one call per reportable
/// job, in original job-list order.
pub trait ReportSink {
    fn record_new(&mut self, state: JobState);
    fn record_unchanged(&mut self, state: JobState);
    fn record_changed(&mut self, state: JobState);
    fn record_error(&mut self, state: JobState);
}

/// The aggregate outcome of one run, handed to report delivery.
#[derive(Debug)]
pub struct RunReport {
    job_states: Vec<JobState>,
    /// Result of the best-effort release check; `None` when the check was
    /// disabled or had not finished by the time the report was sealed.
    pub new_release: Option<String>,
    started: Instant,
    duration: Duration,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            job_states: Vec::new(),
            new_release: None,
            started: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    fn record(&mut self, verb: Verb, mut state: JobState) {
        if let (Verb::Error, Some(error)) = (verb, &state.error) {
            tracing::debug!(job = state.index_number, %error, "job surfaced an error");
        }
        state.verb = verb;
        self.job_states.push(state);
    }

    /// All recorded outcomes, in job order (phase 1 before phase 2).
    pub fn job_states(&self) -> &[JobState] {
        &self.job_states
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.job_states
            .iter()
            .filter(|state| state.verb == verb)
            .count()
    }

    /// Seals the report, fixing the run duration.
    pub(crate) fn finish(&mut self) {
        self.duration = self.started.elapsed();
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl ReportSink for RunReport {
    fn record_new(&mut self, state: JobState) {
        self.record(Verb::New, state);
    }

    fn record_unchanged(&mut self, state: JobState) {
        self.record(Verb::Unchanged, state);
    }

    fn record_changed(&mut self, state: JobState) {
        self.record(Verb::Changed, state);
    }

    fn record_error(&mut self, state: JobState) {
        self.record(Verb::Error, state);
    }
}
