//! Bulk history load.
//!
//! Walks every ticker sequentially, loading the trailing `hours` of minute
//! bars through the range collector, paced to stay clear of the provider's
//! limits. Only a summary is written: `nasdaq100_load_<stamp>.json` with
//! per-run totals.

use chrono::Utc;
use marketfeed_core::{Outcome, OutcomeCounts, Pacer, PacingPolicy, ReferenceZone, SnapshotWriter};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{CollectorConfig, ConfigError, PathsConfig};
use crate::orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
use crate::range::{RangeCollector, RangeRequest};
use crate::tickers::{load_tickers, Ticker};

const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `nasdaq100_load_<stamp>.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillSummary {
    pub timestamp: String,
    pub hours: u32,
    pub total_symbols: usize,
    pub success_count: usize,
    /// Symbols without data plus symbols that failed.
    pub error_count: usize,
    pub total_candles: usize,
}

pub struct Backfill<'a> {
    pub collector: RangeCollector<'a>,
    pub hours: u32,
    pub pacing: PacingPolicy,
    pub zone: ReferenceZone,
    pub paths: PathsConfig,
}

impl<'a> Backfill<'a> {
    pub fn from_config(config: &CollectorConfig, collector: RangeCollector<'a>) -> Result<Self, ConfigError> {
        Ok(Self {
            collector,
            hours: config.backfill.hours,
            pacing: config.backfill.pacing,
            zone: config.zone()?,
            paths: config.paths.clone(),
        })
    }

    /// Override the configured window.
    pub fn with_hours(mut self, hours: u32) -> Self {
        self.hours = hours;
        self
    }

    pub fn run(&self, ctx: &RunContext<'_>) -> Result<RunReport, RunFailure> {
        let mut run = Run::start("backfill");

        run.advance(RunState::LoadingItems);
        let tickers = load_tickers(&self.paths.tickers).map_err(|e| run.fail(e, OutcomeCounts::default()))?;
        info!(
            symbols = tickers.len(),
            hours = self.hours,
            expected_minutes = tickers.len() as u64 * self.pacing.base_delay_ms / 60_000,
            "backfill started"
        );

        run.advance(RunState::Dispatching);
        let (counts, total_candles) = self.load_all(&tickers, ctx);

        run.advance(RunState::Aggregating);
        if ctx.is_cancelled() {
            return Err(run.fail(RunError::Interrupted, counts));
        }
        let finished = Utc::now();
        let summary = BackfillSummary {
            timestamp: self.zone.format(finished),
            hours: self.hours,
            total_symbols: tickers.len(),
            success_count: counts.succeeded,
            error_count: counts.skipped + counts.failed,
            total_candles,
        };

        run.advance(RunState::Writing);
        let stamp = finished.with_timezone(&self.zone.tz()).format(FILE_STAMP_FORMAT).to_string();
        let written = SnapshotWriter::new(self.paths.backfill_summary(&stamp))
            .write_document(summary.total_symbols, &summary)
            .map_err(|e| run.fail(e, counts))?;
        info!(
            path = %written.path.display(),
            success = summary.success_count,
            errors = summary.error_count,
            candles = summary.total_candles,
            "backfill summary saved"
        );

        Ok(run.finish(tickers.len(), counts, Some(written)))
    }

    /// Load every ticker in order. Returns the tallies and the candle total.
    pub fn load_all(&self, tickers: &[Ticker], ctx: &RunContext<'_>) -> (OutcomeCounts, usize) {
        let total = tickers.len();
        let mut pacer = Pacer::new(self.pacing);
        let mut counts = OutcomeCounts::default();
        let mut candles = 0;

        for (index, ticker) in tickers.iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(done = index, total, "interrupted; stopping");
                break;
            }
            ctx.sleeper.sleep(pacer.before_each(index, total));
            info!("[{}/{}] {}", index + 1, total, ticker.symbol);

            let request = RangeRequest {
                symbol: Some(ticker.symbol.clone()),
                hours: Some(self.hours),
                ..RangeRequest::default()
            };
            let outcome = match self.collector.collect(&request, Utc::now()) {
                Ok(result) if result.data.is_empty() => {
                    warn!(symbol = %ticker.symbol, "no data");
                    Outcome::Skipped("no data".into())
                }
                Ok(result) => {
                    info!(symbol = %ticker.symbol, candles = result.data.len(), "collected");
                    Outcome::Success(result.data.len())
                }
                Err(e) => {
                    warn!(symbol = %ticker.symbol, error = %e, "backfill failed");
                    pacer.record_failure();
                    Outcome::Failed(e.to_string())
                }
            };

            let kind = outcome.kind();
            if let Some(n) = outcome.success() {
                candles += n;
            }
            counts.record(kind);
            ctx.progress.on_item(&ticker.symbol, index + 1, total, kind);
        }

        (counts, candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use marketfeed_core::data::{ChartSource, FetchError};
    use marketfeed_core::{Backoff, CandleSelector, NoProgress, RawSeries, RetryPolicy, Sleeper};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, d: Duration) {
            self.0.lock().unwrap().push(d);
        }
    }

    /// AAPL has three complete bars, MSFT none, TSLA a changed format.
    struct History {
        windows: Mutex<Vec<(String, i64)>>,
    }

    impl ChartSource for History {
        fn name(&self) -> &str {
            "history"
        }

        fn latest(&self, symbol: &str) -> Result<RawSeries, FetchError> {
            Err(FetchError::NoData { symbol: symbol.into() })
        }

        fn range(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawSeries, FetchError> {
            self.windows
                .lock()
                .unwrap()
                .push((symbol.to_string(), (end - start).num_hours()));
            match symbol {
                "AAPL" => Ok(RawSeries {
                    symbol: symbol.into(),
                    timestamps: vec![1_700_000_000, 1_700_000_060, 1_700_000_120],
                    open: vec![Some(10.0); 3],
                    high: vec![Some(11.0); 3],
                    low: vec![Some(9.0); 3],
                    close: vec![Some(10.5); 3],
                    volume: vec![Some(100); 3],
                }),
                "TSLA" => Err(FetchError::ResponseFormatChanged("x".into())),
                _ => Err(FetchError::NoData { symbol: symbol.into() }),
            }
        }
    }

    fn backfill<'a>(source: &'a History, sleeper: &'a RecordingSleeper, dir: &std::path::Path) -> Backfill<'a> {
        Backfill {
            collector: RangeCollector {
                source,
                selector: CandleSelector::default(),
                retry: RetryPolicy {
                    max_retries: 0,
                    backoff: Backoff::Fixed { delay_ms: 0 },
                    throttle_wait_ms: 0,
                },
                sleeper,
            },
            hours: 720,
            pacing: CollectorConfig::default().backfill.pacing,
            zone: ReferenceZone::default(),
            paths: PathsConfig {
                tickers: dir.join("tickers.csv"),
                output_dir: dir.join("results"),
            },
        }
    }

    #[test]
    fn summary_counts_candles_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tickers.csv"), "symbol\nAAPL\nMSFT\nTSLA\n").unwrap();
        let source = History {
            windows: Mutex::new(Vec::new()),
        };
        let sleeper = RecordingSleeper::default();

        let report = backfill(&source, &sleeper, dir.path())
            .with_hours(48)
            .run(&RunContext::new(&sleeper, &NoProgress))
            .unwrap();

        assert_eq!((report.succeeded, report.skipped, report.failed), (1, 1, 1));
        let windows = source.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|(_, hours)| *hours == 48));

        let s = Duration::from_secs;
        assert_eq!(*sleeper.0.lock().unwrap(), vec![s(0), s(2), s(2)]);

        let path = report.snapshot.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("nasdaq100_load_") && name.ends_with(".json"));
        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["hours"], 48);
        assert_eq!(doc["total_symbols"], 3);
        assert_eq!(doc["success_count"], 1);
        assert_eq!(doc["error_count"], 2);
        assert_eq!(doc["total_candles"], 3);
    }

    #[test]
    fn cancelled_backfill_writes_no_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tickers.csv"), "symbol\nAAPL\n").unwrap();
        let source = History {
            windows: Mutex::new(Vec::new()),
        };
        let sleeper = RecordingSleeper::default();
        let cancel = std::sync::atomic::AtomicBool::new(true);

        let failure = backfill(&source, &sleeper, dir.path())
            .run(&RunContext::new(&sleeper, &NoProgress).with_cancel(&cancel))
            .unwrap_err();
        assert!(matches!(failure.error, RunError::Interrupted));
        assert!(source.windows.lock().unwrap().is_empty());
        assert!(!dir.path().join("results").exists());
    }
}
