//! The change classifier: decides the verb for a completed fetch and, for
//! changes, which old snapshot to diff against.
//!
//! A freshly fetched result is compared against the fingerprint's full
//! deduplicated history. Exact matches anywhere in history count as
//! unchanged (content reverting to an earlier known state is not a change).
//! When nothing matches exactly and more than one distinct snapshot exists,
//! the best fuzzy match above [`SIMILARITY_CUTOFF`] replaces the strictly
//! previous snapshot as the diff baseline, avoiding noisy diffs against an
//! outlier when a good-enough closer match exists further back.
use crate::{
    job::FetchError,
    retry::{self, RetryDecision},
    state::JobState,
    store::Snapshot,
};

/// Minimum similarity ratio for a historical snapshot to be adopted as the
/// diff baseline. Tunable; the classifier's contract is "closest match above
/// the cutoff", not this exact value.
pub const SIMILARITY_CUTOFF: f64 = 0.6;

/// What one processed job run amounts to.
///
/// `Suppressed` is a failing run under the job's `max_tries` threshold: the
/// old data is re-saved with the incremented counter, but nothing is
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    New,
    /// `resave` is set when the stored tries counter needs resetting; an
    /// unchanged run with a clean counter writes nothing, keeping history
    /// free of duplicates.
    Unchanged { resave: bool },
    Changed,
    Suppressed,
    /// The job's configuration ignores this error: logged only, nothing
    /// persisted or reported, counter untouched.
    Ignored,
    Error,
}

/// Classifies one completed fetch, updating `state` in place: resets or
/// increments `tries`, and for fuzzy-matched changes replaces `state.old`
/// with the adopted baseline.
///
/// `history` must be most-recent first and deduplicated by content, as
/// returned by [`crate::store::Store::history`].
pub fn classify(state: &mut JobState, history: &[Snapshot], max_tries: u32) -> Disposition {
    match &state.error {
        Some(FetchError::NotModified) => {
            tracing::info!(
                job = state.index_number,
                "job has not changed (HTTP 304 response or same strong validator)"
            );
            let resave = state.tries > 0;
            state.tries = 0;
            Disposition::Unchanged { resave }
        }
        Some(FetchError::Ignored(reason)) => {
            tracing::info!(
                job = state.index_number,
                %reason,
                "error while executing job was ignored"
            );
            Disposition::Ignored
        }
        Some(error @ FetchError::Failed(_)) => {
            let (tries, decision) = retry::on_failure(state.tries, max_tries);
            state.tries = tries;
            match decision {
                RetryDecision::Suppress => {
                    tracing::debug!(
                        job = state.index_number,
                        tries,
                        max_tries,
                        %error,
                        "error suppressed: cumulative failures below threshold"
                    );
                    Disposition::Suppressed
                }
                RetryDecision::Report => {
                    tracing::debug!(
                        job = state.index_number,
                        tries,
                        max_tries,
                        %error,
                        "flagged as error: failure threshold met"
                    );
                    Disposition::Error
                }
            }
        }
        None if !state.old.exists() => {
            // First observation ever for this fingerprint.
            state.tries = 0;
            Disposition::New
        }
        None => {
            let exact = state.new_data == state.old.data
                || history.iter().any(|snapshot| snapshot.data == state.new_data);
            if exact {
                let resave = state.tries > 0;
                state.tries = 0;
                return Disposition::Unchanged { resave };
            }
            if history.len() > 1 {
                if let Some(baseline) = closest_match(&state.new_data, history, SIMILARITY_CUTOFF) {
                    tracing::debug!(
                        job = state.index_number,
                        baseline_timestamp = baseline.timestamp,
                        "diffing against closest fuzzy-matching snapshot"
                    );
                    state.old = baseline.clone();
                }
            }
            state.tries = 0;
            Disposition::Changed
        }
    }
}

/// Returns the single best-scoring historical snapshot with similarity to
/// `target` at or above `cutoff`, ties broken by most-recent history order.
fn closest_match<'a>(target: &str, history: &'a [Snapshot], cutoff: f64) -> Option<&'a Snapshot> {
    let mut best: Option<(f64, &Snapshot)> = None;
    for snapshot in history {
        if similarity::upper_bound(target, &snapshot.data) < cutoff {
            continue;
        }
        let score = similarity::ratio(target, &snapshot.data);
        if score >= cutoff && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, snapshot));
        }
    }
    best.map(|(_, snapshot)| snapshot)
}

/// Ratcliff/Obershelp sequence similarity over bytes, equivalent to Python's
/// `difflib.SequenceMatcher.ratio` without junk handling: twice the total
/// length of matching blocks divided by the combined length.
mod similarity {
    use fxhash::FxHashMap;

    /// A cheap upper bound on [`ratio`], from per-byte frequency tables.
    /// Used to skip the quadratic pass for clearly dissimilar snapshots.
    pub(super) fn upper_bound(a: &str, b: &str) -> f64 {
        let (a, b) = (a.as_bytes(), b.as_bytes());
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let mut counts = [0i64; 256];
        for &byte in a {
            counts[byte as usize] += 1;
        }
        let mut matches = 0i64;
        for &byte in b {
            if counts[byte as usize] > 0 {
                matches += 1;
            }
            counts[byte as usize] -= 1;
        }
        2.0 * matches as f64 / (a.len() + b.len()) as f64
    }

    pub(super) fn ratio(a: &str, b: &str) -> f64 {
        let (a, b) = (a.as_bytes(), b.as_bytes());
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        2.0 * total_matched(a, b) as f64 / (a.len() + b.len()) as f64
    }

    /// Sum of the lengths of all matching blocks: the longest common block,
    /// then recursively the longest blocks to its left and right.
    fn total_matched(a: &[u8], b: &[u8]) -> usize {
        let mut b2j: FxHashMap<u8, Vec<usize>> = FxHashMap::default();
        for (j, &byte) in b.iter().enumerate() {
            b2j.entry(byte).or_default().push(j);
        }

        let mut total = 0;
        let mut queue = vec![(0, a.len(), 0, b.len())];
        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, size) = longest_match(a, &b2j, alo, ahi, blo, bhi);
            if size > 0 {
                total += size;
                queue.push((alo, i, blo, j));
                queue.push((i + size, ahi, j + size, bhi));
            }
        }
        total
    }

    fn longest_match(
        a: &[u8],
        b2j: &FxHashMap<u8, Vec<usize>>,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
        // j2len[j] = length of the longest run ending at a[i], b[j].
        let mut j2len: FxHashMap<usize, usize> = FxHashMap::default();
        for (i, &byte) in a.iter().enumerate().take(ahi).skip(alo) {
            let mut new_j2len: FxHashMap<usize, usize> = FxHashMap::default();
            if let Some(positions) = b2j.get(&byte) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let size = match j.checked_sub(1).and_then(|prev| j2len.get(&prev)) {
                        Some(run) => run + 1,
                        None => 1,
                    };
                    new_j2len.insert(j, size);
                    if size > best_size {
                        best_i = i + 1 - size;
                        best_j = j + 1 - size;
                        best_size = size;
                    }
                }
            }
            j2len = new_j2len;
        }
        (best_i, best_j, best_size)
    }

}
