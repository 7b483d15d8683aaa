//! Marketfeed Core: the building blocks of a fault-tolerant batch collector.
//!
//! This crate contains everything that does not depend on a particular
//! collection run:
//! - Candle selection and validation from raw provider series
//! - Retry executor with monotonic backoff and failure classification
//! - Pacing controller for undocumented external rate limits
//! - Bounded worker-pool dispatch with per-item outcomes
//! - Order-preserving deduplication
//! - Atomic snapshot writing with timestamp normalization
//! - Provider traits plus the Yahoo Finance adapters

pub mod candle;
pub mod data;
pub mod dedupe;
pub mod dispatch;
pub mod news;
pub mod pacing;
pub mod retry;
pub mod snapshot;
pub mod timefmt;

pub use candle::{Candle, CandleSelector, NotFound, PriceBounds, RawSeries};
pub use dedupe::{dedupe, DedupeStats, Identity};
pub use dispatch::{
    dispatch, DispatchError, NoProgress, Outcome, OutcomeCounts, OutcomeKind, Progress, StdoutProgress,
    WorkItem,
};
pub use pacing::{Pacer, PacingPolicy};
pub use retry::{run_with_retry, Attempted, Backoff, Classify, RetryPolicy, Sleeper, ThreadSleeper};
pub use snapshot::{SnapshotError, SnapshotWriter, WrittenSnapshot};
pub use timefmt::{normalize_timestamp, ReferenceZone, TIMESTAMP_FORMAT};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn pool_types_are_send_sync() {
        assert_send_sync::<Candle>();
        assert_send_sync::<RawSeries>();
        assert_send_sync::<CandleSelector>();
        assert_send_sync::<RetryPolicy>();
        assert_send_sync::<Outcome<Candle>>();
        assert_send_sync::<news::NewsRecord>();
        assert_send_sync::<data::FetchError>();
    }

    #[test]
    fn provider_is_shared_across_workers() {
        assert_send_sync::<data::CircuitBreaker>();
        assert_send_sync::<data::YahooClient>();
        assert_send_sync::<Box<dyn data::ChartSource>>();
        assert_send_sync::<Box<dyn data::NewsSource>>();
        assert_send_sync::<Box<dyn data::FundamentalsSource>>();
    }
}
