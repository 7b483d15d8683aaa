//! Run lifecycle shared by every pipeline.
//!
//! A run moves `Idle → LoadingItems → Dispatching → Aggregating → Writing →
//! Done`; `Failed` is reachable from any state. Per-item failures never make
//! a run fail: only an unloadable work list, a refused or failed snapshot
//! write, a broken worker pool or an interrupt do.

use marketfeed_core::data::FetchError;
use marketfeed_core::{
    DispatchError, NoProgress, OutcomeCounts, Progress, SnapshotError, Sleeper, StdoutProgress,
    ThreadSleeper, WrittenSnapshot,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::news::ScanError;
use crate::tickers::TickerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LoadingItems,
    Dispatching,
    Aggregating,
    Writing,
    Done,
    Failed,
}

impl RunState {
    /// Legal forward transitions. `Failed` is reachable from anything but `Done`.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, LoadingItems)
                | (LoadingItems, Dispatching)
                | (Dispatching, Aggregating)
                | (Aggregating, Writing)
                | (Writing, Done)
        ) || (next == Failed && self != Done && self != Failed)
    }
}

/// Fatal-run failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot load work list: {0}")]
    LoadItems(#[from] TickerError),

    #[error("cannot load scanned news: {0}")]
    Scan(#[from] ScanError),

    #[error("refusing to overwrite {}: no records collected", .path.display())]
    SnapshotRefused { path: PathBuf },

    #[error("snapshot write failed: {0}")]
    Snapshot(#[source] SnapshotError),

    #[error("worker pool: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("extraction session unavailable: {0}")]
    Session(#[source] FetchError),

    #[error("interrupted")]
    Interrupted,
}

impl From<SnapshotError> for RunError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::EmptyRecords { path } => RunError::SnapshotRefused { path },
            other => RunError::Snapshot(other),
        }
    }
}

/// A run that ended in `Failed`, with what was known when it stopped.
#[derive(Debug, Error)]
#[error("{pipeline} run failed while {state:?}: {error}")]
pub struct RunFailure {
    pub pipeline: &'static str,
    /// State the run was in when it failed.
    pub state: RunState,
    pub counts: OutcomeCounts,
    #[source]
    pub error: RunError,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: &'static str,
    pub state: RunState,
    pub requested: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub snapshot: Option<PathBuf>,
    /// BLAKE3 of the written snapshot bytes.
    pub snapshot_hash: Option<String>,
}

impl RunReport {
    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            succeeded: self.succeeded,
            skipped: self.skipped,
            failed: self.failed,
        }
    }
}

/// Tracks one run through its states.
#[derive(Debug)]
pub struct Run {
    pipeline: &'static str,
    state: RunState,
    started: Instant,
}

impl Run {
    pub fn start(pipeline: &'static str) -> Self {
        info!(pipeline, "run started");
        Self {
            pipeline,
            state: RunState::Idle,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        debug!(pipeline = self.pipeline, from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    /// Move to `Failed`, keeping the state the failure happened in.
    pub fn fail(&mut self, error: impl Into<RunError>, counts: OutcomeCounts) -> RunFailure {
        let error = error.into();
        let state = self.state;
        error!(pipeline = self.pipeline, ?state, %error, "run failed");
        self.state = RunState::Failed;
        RunFailure {
            pipeline: self.pipeline,
            state,
            counts,
            error,
        }
    }

    pub fn finish(mut self, requested: usize, counts: OutcomeCounts, written: Option<WrittenSnapshot>) -> RunReport {
        self.advance(RunState::Done);
        let report = RunReport {
            pipeline: self.pipeline,
            state: self.state,
            requested,
            succeeded: counts.succeeded,
            skipped: counts.skipped,
            failed: counts.failed,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            snapshot: written.as_ref().map(|w| w.path.clone()),
            snapshot_hash: written.map(|w| w.hash),
        };
        info!(
            pipeline = report.pipeline,
            requested = report.requested,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            hash = report.snapshot_hash.as_deref().unwrap_or("-"),
            "run done"
        );
        report
    }
}

/// Ambient collaborators every pipeline needs.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub sleeper: &'a dyn Sleeper,
    pub progress: &'a dyn Progress,
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a> RunContext<'a> {
    pub fn new(sleeper: &'a dyn Sleeper, progress: &'a dyn Progress) -> Self {
        Self {
            sleeper,
            progress,
            cancel: None,
        }
    }

    /// Real sleeps and `PROGRESS:` lines on stdout.
    pub fn production() -> RunContext<'static> {
        RunContext::new(&ThreadSleeper, &StdoutProgress)
    }

    /// Real sleeps, no progress output.
    pub fn quiet() -> RunContext<'static> {
        RunContext::new(&ThreadSleeper, &NoProgress)
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|f| f.load(Ordering::Relaxed))
    }
}
