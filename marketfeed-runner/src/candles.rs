//! Minute-bar cycle: one latest candle per ticker into `latest_data.json`.

use marketfeed_core::data::{ChartSource, FetchError};
use marketfeed_core::{
    dispatch, run_with_retry, Candle, CandleSelector, Outcome, OutcomeCounts, RetryPolicy, SnapshotWriter,
    Sleeper,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, ConfigError};
use crate::orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
use crate::tickers::{load_tickers, Ticker};

/// Everything one candle cycle needs.
pub struct CandleCycle<'a> {
    pub source: &'a dyn ChartSource,
    pub selector: CandleSelector,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub tickers: PathBuf,
    pub snapshot: PathBuf,
}

impl<'a> CandleCycle<'a> {
    pub fn from_config(config: &CollectorConfig, source: &'a dyn ChartSource) -> Result<Self, ConfigError> {
        Ok(Self {
            source,
            selector: CandleSelector::new(config.bounds(), config.zone()?),
            retry: config.retry,
            concurrency: config.candles.concurrency,
            tickers: config.paths.tickers.clone(),
            snapshot: config.paths.latest_snapshot(),
        })
    }

    /// Load the ticker list, collect every symbol and replace the snapshot.
    pub fn run(&self, ctx: &RunContext<'_>) -> Result<RunReport, RunFailure> {
        let mut run = Run::start("candles");

        run.advance(RunState::LoadingItems);
        let tickers = load_tickers(&self.tickers).map_err(|e| run.fail(e, OutcomeCounts::default()))?;
        let batch_timestamp = self.selector.zone().now();

        run.advance(RunState::Dispatching);
        let outcomes = self
            .collect(&tickers, ctx)
            .map_err(|e| run.fail(e, OutcomeCounts::default()))?;

        run.advance(RunState::Aggregating);
        let counts = OutcomeCounts::from_outcomes(outcomes.values());
        if ctx.is_cancelled() {
            return Err(run.fail(RunError::Interrupted, counts));
        }
        let records = aggregate(outcomes);

        run.advance(RunState::Writing);
        let written = SnapshotWriter::new(&self.snapshot)
            .write(&batch_timestamp, &records)
            .map_err(|e| run.fail(e, counts))?;
        info!(
            path = %written.path.display(),
            records = records.len(),
            "latest snapshot replaced"
        );

        Ok(run.finish(tickers.len(), counts, Some(written)))
    }

    /// Fetch and select a candle for every ticker on the worker pool.
    pub fn collect(
        &self,
        tickers: &[Ticker],
        ctx: &RunContext<'_>,
    ) -> Result<BTreeMap<String, Outcome<Candle>>, marketfeed_core::DispatchError> {
        dispatch(tickers, self.concurrency, ctx.progress, |ticker| {
            if ctx.is_cancelled() {
                return Outcome::Skipped("interrupted".into());
            }
            collect_symbol(self.source, &self.selector, &self.retry, ctx.sleeper, &ticker.symbol)
        })
    }
}

/// One symbol: fetch with retry, then select and validate.
///
/// A bar that fails validation is a failure for the symbol; no bars at all
/// is a skip.
pub fn collect_symbol(
    source: &dyn ChartSource,
    selector: &CandleSelector,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    symbol: &str,
) -> Outcome<Candle> {
    if !source.is_available() {
        return Outcome::Failed(FetchError::CircuitBreakerTripped.to_string());
    }

    let attempted = run_with_retry(retry, sleeper, |_| source.latest(symbol));
    match attempted.result {
        Ok(series) => match selector.select(&series) {
            Ok(candle) => {
                debug!(symbol, timestamp = %candle.timestamp, close = %candle.close, "candle selected");
                Outcome::Success(candle)
            }
            Err(reason) if reason.is_validation_failure() => {
                warn!(symbol, %reason, "candle rejected");
                Outcome::Failed(reason.to_string())
            }
            Err(reason) => Outcome::Skipped(reason.to_string()),
        },
        Err(e) if e.is_expected_empty() => Outcome::Skipped(e.to_string()),
        Err(e) => {
            warn!(symbol, attempts = attempted.attempts, error = %e, "fetch failed");
            Outcome::Failed(format!("{e} (after {} attempts)", attempted.attempts))
        }
    }
}

/// Keep the successful candles, keyed by symbol.
pub fn aggregate(outcomes: BTreeMap<String, Outcome<Candle>>) -> BTreeMap<String, Candle> {
    outcomes
        .into_iter()
        .filter_map(|(symbol, outcome)| match outcome {
            Outcome::Success(candle) => Some((symbol, candle)),
            Outcome::Failed(reason) => {
                warn!(symbol, %reason, "no candle");
                None
            }
            Outcome::Skipped(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use marketfeed_core::{Backoff, RawSeries};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoSleep;
    impl Sleeper for NoSleep {
        fn sleep(&self, _: Duration) {}
    }

    struct Scripted {
        responses: Mutex<Vec<Result<RawSeries, FetchError>>>,
        available: bool,
    }

    impl ChartSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn latest(&self, _symbol: &str) -> Result<RawSeries, FetchError> {
            self.responses.lock().unwrap().remove(0)
        }
        fn range(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<RawSeries, FetchError> {
            unreachable!()
        }
        fn is_available(&self) -> bool {
            self.available
        }
    }

    fn bars(close: f64, high: f64, low: f64) -> RawSeries {
        RawSeries {
            symbol: "X".into(),
            timestamps: vec![1_700_000_000, 1_700_000_060],
            open: vec![Some(close), Some(close)],
            high: vec![Some(high), Some(high)],
            low: vec![Some(low), Some(low)],
            close: vec![Some(close), Some(close)],
            volume: vec![Some(10), Some(20)],
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed { delay_ms: 0 },
            throttle_wait_ms: 0,
        }
    }

    fn run(responses: Vec<Result<RawSeries, FetchError>>, available: bool) -> Outcome<Candle> {
        let source = Scripted {
            responses: Mutex::new(responses),
            available,
        };
        collect_symbol(&source, &CandleSelector::default(), &retry(), &NoSleep, "X")
    }

    #[test]
    fn valid_bar_is_success() {
        assert!(run(vec![Ok(bars(10.0, 11.0, 9.0))], true).is_success());
    }

    #[test]
    fn inconsistent_bar_is_failure() {
        assert_eq!(run(vec![Ok(bars(10.0, 9.0, 11.0))], true).kind(), marketfeed_core::OutcomeKind::Failed);
    }

    #[test]
    fn no_data_is_skip() {
        let out = run(vec![Err(FetchError::NoData { symbol: "X".into() })], true);
        assert_eq!(out.kind(), marketfeed_core::OutcomeKind::Skipped);
    }

    #[test]
    fn transient_errors_retried() {
        let out = run(
            vec![
                Err(FetchError::Timeout("t".into())),
                Err(FetchError::Timeout("t".into())),
                Ok(bars(10.0, 11.0, 9.0)),
            ],
            true,
        );
        assert!(out.is_success());
    }

    #[test]
    fn exhausted_retries_is_failure() {
        let out = run(vec![Err(FetchError::Timeout("t".into())); 3], true);
        assert!(out.reason().unwrap().contains("after 3 attempts"));
    }

    #[test]
    fn tripped_breaker_fails_without_request() {
        let out = run(Vec::new(), false);
        assert_eq!(out.kind(), marketfeed_core::OutcomeKind::Failed);
    }

    #[test]
    fn aggregate_keeps_successes_only() {
        let mut outcomes = BTreeMap::new();
        let candle = match run(vec![Ok(bars(10.0, 11.0, 9.0))], true) {
            Outcome::Success(c) => c,
            other => panic!("unexpected {other:?}"),
        };
        outcomes.insert("A".to_string(), Outcome::Success(candle));
        outcomes.insert("B".to_string(), Outcome::Failed("bad".into()));
        outcomes.insert("C".to_string(), Outcome::Skipped("empty".into()));
        let records = aggregate(outcomes);
        assert_eq!(records.keys().collect::<Vec<_>>(), ["A"]);
    }
}
