//! Fundamentals pipeline.
//!
//! Symbols are processed one at a time with conservative pacing. Every
//! ticker yields a record (statements, key statistics, dividends and
//! profile); a symbol that fails after its retries gets a placeholder with
//! `success: false` and the last error.

use chrono::Utc;
use marketfeed_core::data::{Dividend, FetchError, Fundamentals, FundamentalsSource, StatementHistory};
use marketfeed_core::{
    run_with_retry, Classify, Outcome, OutcomeCounts, OutcomeKind, Pacer, PacingPolicy, ReferenceZone, RetryPolicy,
    SnapshotWriter,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{CollectorConfig, ConfigError};
use crate::orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
use crate::tickers::{load_tickers, Ticker};

/// Output file name stamp, `YYYYmmdd_HHMMSS` in the reference zone.
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundamentalsRecord {
    pub symbol: String,
    pub name: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub income_statement: StatementHistory,
    pub balance_sheet: StatementHistory,
    pub cashflow: StatementHistory,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub dividends: Vec<Dividend>,
    pub company_info: BTreeMap<String, Value>,
}

impl FundamentalsRecord {
    fn collected(ticker: &Ticker, data: Fundamentals) -> Self {
        Self {
            symbol: ticker.symbol.clone(),
            name: ticker.name.clone(),
            success: true,
            error: None,
            income_statement: data.income_statement,
            balance_sheet: data.balance_sheet,
            cashflow: data.cashflow,
            metrics: data.metrics,
            dividends: data.dividends,
            company_info: data.company_info,
        }
    }

    fn placeholder(ticker: &Ticker, error: &FetchError) -> Self {
        Self {
            symbol: ticker.symbol.clone(),
            name: ticker.name.clone(),
            success: false,
            error: Some(error.to_string()),
            income_statement: StatementHistory::default(),
            balance_sheet: StatementHistory::default(),
            cashflow: StatementHistory::default(),
            metrics: BTreeMap::new(),
            dividends: Vec::new(),
            company_info: BTreeMap::new(),
        }
    }
}

/// `financial_data_<stamp>.json`.
#[derive(Debug, Serialize)]
pub struct FundamentalsDocument {
    pub timestamp: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// Failed attempts across all symbols, retries included.
    pub errors: u32,
    pub data: Vec<FundamentalsRecord>,
}

pub struct FundamentalsPipeline<'a> {
    pub source: &'a dyn FundamentalsSource,
    pub pacing: PacingPolicy,
    pub retry: RetryPolicy,
    pub zone: ReferenceZone,
    pub tickers: PathBuf,
    pub output_dir: PathBuf,
}

impl<'a> FundamentalsPipeline<'a> {
    pub fn from_config(config: &CollectorConfig, source: &'a dyn FundamentalsSource) -> Result<Self, ConfigError> {
        Ok(Self {
            source,
            pacing: config.fundamentals.pacing,
            retry: config.fundamentals.retry,
            zone: config.zone()?,
            tickers: config.paths.tickers.clone(),
            output_dir: config.paths.output_dir.clone(),
        })
    }

    pub fn run(&self, ctx: &RunContext<'_>) -> Result<RunReport, RunFailure> {
        let mut run = Run::start("fundamentals");

        run.advance(RunState::LoadingItems);
        let tickers = load_tickers(&self.tickers).map_err(|e| run.fail(e, OutcomeCounts::default()))?;
        let started = Utc::now();

        run.advance(RunState::Dispatching);
        let (records, counts, errors) = self.collect(&tickers, ctx);

        run.advance(RunState::Aggregating);
        if ctx.is_cancelled() {
            return Err(run.fail(RunError::Interrupted, counts));
        }
        let doc = FundamentalsDocument {
            timestamp: self.zone.format(started),
            total: tickers.len(),
            success: counts.succeeded,
            failed: counts.skipped + counts.failed,
            errors,
            data: records,
        };

        run.advance(RunState::Writing);
        let stamp = started.with_timezone(&self.zone.tz()).format(FILE_STAMP_FORMAT).to_string();
        let path = self.output_dir.join(format!("financial_data_{stamp}.json"));
        let written = SnapshotWriter::new(path)
            .write_document(counts.succeeded, &doc)
            .map_err(|e| run.fail(e, counts))?;
        info!(
            path = %written.path.display(),
            success = doc.success,
            failed = doc.failed,
            errors = doc.errors,
            "fundamentals saved"
        );

        Ok(run.finish(tickers.len(), counts, Some(written)))
    }

    /// Collect every ticker in order. Returns the records, the outcome
    /// tallies and the number of failed attempts.
    pub fn collect(&self, tickers: &[Ticker], ctx: &RunContext<'_>) -> (Vec<FundamentalsRecord>, OutcomeCounts, u32) {
        let total = tickers.len();
        let mut pacer = Pacer::new(self.pacing);
        let retry = pacer.escalate(self.retry);
        let mut records = Vec::with_capacity(total);
        let mut counts = OutcomeCounts::default();
        let mut errors = 0u32;

        for (index, ticker) in tickers.iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(done = index, total, "interrupted; stopping");
                break;
            }
            ctx.sleeper.sleep(pacer.before_each(index, total));

            let attempted = run_with_retry(&retry, ctx.sleeper, |_| self.source.fundamentals(&ticker.symbol));
            let (record, outcome) = match attempted.result {
                Ok(data) => {
                    errors += attempted.attempts - 1;
                    let non_null = data.metrics.values().filter(|v| v.is_some()).count();
                    info!(
                        symbol = %ticker.symbol,
                        quarters = data.income_statement.quarterly.len(),
                        years = data.income_statement.yearly.len(),
                        metrics = non_null,
                        dividends = data.dividends.len(),
                        "fundamentals collected"
                    );
                    (FundamentalsRecord::collected(ticker, data), Outcome::Success(()))
                }
                Err(e) => {
                    errors += attempted.attempts;
                    warn!(symbol = %ticker.symbol, attempts = attempted.attempts, error = %e, "fundamentals failed");
                    // The last throttle had no retry to wait in front of.
                    if e.is_throttle() {
                        ctx.sleeper.sleep(pacer.on_throttle_signal());
                    }
                    let outcome = if e.is_expected_empty() {
                        Outcome::Skipped(e.to_string())
                    } else {
                        pacer.record_failure();
                        Outcome::Failed(e.to_string())
                    };
                    (FundamentalsRecord::placeholder(ticker, &e), outcome)
                }
            };

            let kind: OutcomeKind = outcome.kind();
            counts.record(kind);
            records.push(record);
            ctx.progress.on_item(&ticker.symbol, index + 1, total, kind);
        }

        (records, counts, errors)
    }
}
