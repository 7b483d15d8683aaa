//! Bounded worker-pool dispatch.
//!
//! Every work item produces exactly one tagged [`Outcome`]. A failing or
//! panicking worker is recorded against its own key and never affects its
//! siblings; `dispatch` returns only after every item has finished.
//!
//! The pool is a private `rayon::ThreadPool` sized to the concurrency cap,
//! not the global pool.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    /// Expected-empty: nothing to collect, not an error.
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Skipped,
    Failed,
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::Skipped(_) => OutcomeKind::Skipped,
            Outcome::Failed(_) => OutcomeKind::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Skip or failure reason.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Skipped(r) | Outcome::Failed(r) => Some(r),
        }
    }
}

/// Success / skip / failure tallies for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Success => self.succeeded += 1,
            OutcomeKind::Skipped => self.skipped += 1,
            OutcomeKind::Failed => self.failed += 1,
        }
    }

    pub fn from_outcomes<'a, T: 'a>(outcomes: impl IntoIterator<Item = &'a Outcome<T>>) -> Self {
        let mut counts = Self::default();
        for o in outcomes {
            counts.record(o.kind());
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

/// Anything with a stable identity key.
pub trait WorkItem {
    fn key(&self) -> &str;
}

impl WorkItem for String {
    fn key(&self) -> &str {
        self
    }
}

/// Per-item progress callback.
pub trait Progress: Send + Sync {
    /// Called once per finished item; `done` counts finished items, 1-based.
    fn on_item(&self, key: &str, done: usize, total: usize, kind: OutcomeKind);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn on_item(&self, _key: &str, _done: usize, _total: usize, _kind: OutcomeKind) {}
}

/// Machine-readable progress on stdout: `PROGRESS:<done>/<total>:<key>`.
///
/// A parent process parses these lines; the format must not change.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutProgress;

impl StdoutProgress {
    pub fn line(key: &str, done: usize, total: usize) -> String {
        format!("PROGRESS:{done}/{total}:{key}")
    }
}

impl Progress for StdoutProgress {
    fn on_item(&self, key: &str, done: usize, total: usize, _kind: OutcomeKind) {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", Self::line(key, done, total));
        let _ = out.flush();
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Run `worker` over `items` with at most `max_concurrency` in flight.
///
/// Returns one outcome per distinct key. Panics inside `worker` become
/// [`Outcome::Failed`].
pub fn dispatch<I, T, F>(
    items: &[I],
    max_concurrency: usize,
    progress: &dyn Progress,
    worker: F,
) -> Result<BTreeMap<String, Outcome<T>>, DispatchError>
where
    I: WorkItem + Sync,
    T: Send,
    F: Fn(&I) -> Outcome<T> + Sync,
{
    let total = items.len();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_concurrency.max(1))
        .thread_name(|i| format!("collector-{i}"))
        .build()?;
    let done = AtomicUsize::new(0);

    let results: Vec<(String, Outcome<T>)> = pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                let key = item.key().to_string();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker(item))) {
                    Ok(outcome) => outcome,
                    Err(payload) => Outcome::Failed(format!(
                        "worker panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                };
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.on_item(&key, n, total, outcome.kind());
                (key, outcome)
            })
            .collect()
    });

    Ok(results.into_iter().collect())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i:02}")).collect()
    }

    #[test]
    fn one_failure_does_not_abort_siblings() {
        let items = keys(10);
        let results = dispatch(&items, 4, &NoProgress, |k: &String| {
            if k == "SYM03" {
                Outcome::Failed("boom".into())
            } else {
                Outcome::Success(k.len())
            }
        })
        .unwrap();

        assert_eq!(results.len(), 10);
        let counts = OutcomeCounts::from_outcomes(results.values());
        assert_eq!(counts.succeeded, 9);
        assert_eq!(counts.failed, 1);
        assert_eq!(results["SYM03"].reason(), Some("boom"));
    }

    #[test]
    fn panic_is_isolated() {
        let items = keys(5);
        let results = dispatch(&items, 2, &NoProgress, |k: &String| {
            if k == "SYM01" {
                panic!("worker exploded");
            }
            Outcome::Success(())
        })
        .unwrap();

        assert_eq!(results.len(), 5);
        match &results["SYM01"] {
            Outcome::Failed(msg) => assert!(msg.contains("worker exploded")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn concurrency_cap_respected() {
        let items = keys(16);
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let results = dispatch(&items, 3, &NoProgress, |_k: &String| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Outcome::<()>::Success(())
        })
        .unwrap();

        assert_eq!(results.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    struct Recording(Mutex<Vec<(String, usize, usize)>>);

    impl Progress for Recording {
        fn on_item(&self, key: &str, done: usize, total: usize, _kind: OutcomeKind) {
            self.0.lock().unwrap().push((key.to_string(), done, total));
        }
    }

    #[test]
    fn progress_reported_once_per_item() {
        let items = keys(7);
        let progress = Recording(Mutex::new(Vec::new()));
        dispatch(&items, 3, &progress, |_k: &String| Outcome::<()>::Skipped("empty".into())).unwrap();

        let seen = progress.0.into_inner().unwrap();
        assert_eq!(seen.len(), 7);
        let mut done: Vec<_> = seen.iter().map(|(_, d, _)| *d).collect();
        done.sort_unstable();
        assert_eq!(done, (1..=7).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, _, t)| *t == 7));
    }

    #[test]
    fn empty_input_returns_empty_map() {
        let items: Vec<String> = Vec::new();
        let results = dispatch(&items, 4, &NoProgress, |_k: &String| Outcome::Success(())).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn progress_line_format() {
        assert_eq!(StdoutProgress::line("AAPL", 3, 101), "PROGRESS:3/101:AAPL");
    }
}
