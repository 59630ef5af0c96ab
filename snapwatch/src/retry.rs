//! The per-fingerprint retry policy.
//!
//! The failure counter spans runs, not attempts: a job is fetched once per
//! run, and the counter persisted with its snapshot decides when a failing
//! streak becomes reportable.

/// What to do with a failing fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stay quiet: re-save the old data with the incremented counter and log
    /// at debug level only.
    Suppress,
    /// The failure streak met the job's threshold: surface an error to the
    /// report (and still persist the counter).
    Report,
}

/// Applies the policy to one failing run.
///
/// Returns this run's counter (`stored + 1`) and whether to surface the
/// error. A `max_tries` of 0 means "report on the first error".
pub fn on_failure(stored_tries: u32, max_tries: u32) -> (u32, RetryDecision) {
    let tries = stored_tries + 1;
    if max_tries == 0 || tries >= max_tries {
        (tries, RetryDecision::Report)
    } else {
        (tries, RetryDecision::Suppress)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_max_tries_reports_immediately() {
        assert_eq!(on_failure(0, 0), (1, RetryDecision::Report));
    }

    #[test]
    fn counter_increments_by_one_per_failing_run() {
        assert_eq!(on_failure(0, 5).0, 1);
        assert_eq!(on_failure(3, 5).0, 4);
    }

    #[test]
    fn reports_exactly_when_threshold_met() {
        // max_tries = 3: two suppressed runs, reported on the third.
        assert_eq!(on_failure(0, 3), (1, RetryDecision::Suppress));
        assert_eq!(on_failure(1, 3), (2, RetryDecision::Suppress));
        assert_eq!(on_failure(2, 3), (3, RetryDecision::Report));
        assert_eq!(on_failure(3, 3), (4, RetryDecision::Report));
    }
}
