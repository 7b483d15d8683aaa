//! News date scan.
//!
//! Searches every stock like stage 1 of the news pipeline, then groups the
//! unique stubs by publication date (reference zone) into
//! `scanned_news.json`, newest date first. A later news run can crawl a
//! single date of that file instead of searching again.

use marketfeed_core::data::NewsSource;
use marketfeed_core::news::NewsRecord;
use marketfeed_core::{OutcomeCounts, ReferenceZone, RetryPolicy, SnapshotWriter};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use super::search_tickers;
use crate::config::{CollectorConfig, ConfigError, NewsConfig};
use crate::orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
use crate::tickers::{load_tickers, without_indices, TickerError};

/// Group key for stubs whose publication time is unusable.
const UNKNOWN_DATE: &str = "unknown";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read scan {}: {source}; run `marketfeed scan` first", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed scan file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("date {date} not in scan (available: {})", .available.join(", "))]
    UnknownDate { date: String, available: Vec<String> },
}

/// A search stub plus the date it is grouped under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedNews {
    #[serde(flatten)]
    pub record: NewsRecord,
    pub date: String,
}

impl ScannedNews {
    pub fn new(record: NewsRecord) -> Self {
        let date = record
            .published_at
            .get(..10)
            .filter(|d| d.as_bytes().get(4) == Some(&b'-'))
            .unwrap_or(UNKNOWN_DATE)
            .to_string();
        Self { record, date }
    }
}

#[derive(Debug, Serialize)]
struct DateSummary {
    count: usize,
    symbols: BTreeSet<String>,
}

/// Serializes a date-keyed map newest first.
struct NewestFirst<'a, V>(&'a BTreeMap<String, V>);

impl<V: Serialize> Serialize for NewestFirst<'_, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().rev())
    }
}

#[derive(Serialize)]
struct ScanDocument<'a> {
    scan_timestamp: String,
    total_news: usize,
    date_count: usize,
    date_summary: NewestFirst<'a, DateSummary>,
    news_by_date: NewestFirst<'a, Vec<ScannedNews>>,
}

#[derive(Deserialize)]
struct ScanFile {
    #[serde(default)]
    news_by_date: BTreeMap<String, Vec<ScannedNews>>,
}

/// Group stubs by date, keeping search order within a date.
pub fn group_by_date(stubs: Vec<NewsRecord>) -> BTreeMap<String, Vec<ScannedNews>> {
    let mut groups: BTreeMap<String, Vec<ScannedNews>> = BTreeMap::new();
    for scanned in stubs.into_iter().map(ScannedNews::new) {
        groups.entry(scanned.date.clone()).or_default().push(scanned);
    }
    groups
}

/// The stubs scanned for `date`, in scan order.
pub fn load_scanned_day(path: &Path, date: &str) -> Result<Vec<NewsRecord>, ScanError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScanError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file: ScanFile = serde_json::from_str(&content)?;
    match file.news_by_date.remove(date) {
        Some(day) => Ok(day.into_iter().map(|s| s.record).collect()),
        None => Err(ScanError::UnknownDate {
            date: date.to_string(),
            available: file.news_by_date.into_keys().rev().collect(),
        }),
    }
}

pub struct NewsScan<'a> {
    pub search: &'a dyn NewsSource,
    pub config: NewsConfig,
    pub retry: RetryPolicy,
    pub zone: ReferenceZone,
    pub tickers: PathBuf,
    pub output: PathBuf,
}

impl<'a> NewsScan<'a> {
    pub fn from_config(config: &CollectorConfig, search: &'a dyn NewsSource) -> Result<Self, ConfigError> {
        Ok(Self {
            search,
            config: config.news.clone(),
            retry: config.retry,
            zone: config.zone()?,
            tickers: config.paths.tickers.clone(),
            output: config.paths.scan_snapshot(),
        })
    }

    pub fn run(&self, ctx: &RunContext<'_>) -> Result<RunReport, RunFailure> {
        let mut run = Run::start("scan");

        run.advance(RunState::LoadingItems);
        let tickers = load_tickers(&self.tickers)
            .map(|all| without_indices(&all))
            .and_then(|stocks| {
                if stocks.is_empty() {
                    Err(TickerError::Empty {
                        path: self.tickers.clone(),
                    })
                } else {
                    Ok(stocks)
                }
            })
            .map_err(|e| run.fail(e, OutcomeCounts::default()))?;

        run.advance(RunState::Dispatching);
        let (stubs, counts) = search_tickers(self.search, &self.config, &self.retry, &tickers, ctx, ctx.progress)
            .map_err(|e| run.fail(e, OutcomeCounts::default()))?;

        run.advance(RunState::Aggregating);
        if ctx.is_cancelled() {
            return Err(run.fail(RunError::Interrupted, counts));
        }
        let total = stubs.len();
        let groups = group_by_date(stubs);
        let summary: BTreeMap<String, DateSummary> = groups
            .iter()
            .map(|(date, news)| {
                let symbols = news.iter().filter_map(|n| n.record.symbol.clone()).collect();
                (date.clone(), DateSummary { count: news.len(), symbols })
            })
            .collect();

        run.advance(RunState::Writing);
        if total == 0 {
            info!("no news found; previous scan kept");
            return Ok(run.finish(tickers.len(), counts, None));
        }
        let doc = ScanDocument {
            scan_timestamp: self.zone.now(),
            total_news: total,
            date_count: groups.len(),
            date_summary: NewestFirst(&summary),
            news_by_date: NewestFirst(&groups),
        };
        let written = SnapshotWriter::new(&self.output)
            .write_document(total, &doc)
            .map_err(|e| run.fail(e, counts))?;
        for (date, day) in summary.iter().rev() {
            info!(%date, count = day.count, "scanned");
        }
        info!(path = %written.path.display(), total, dates = groups.len(), "scan saved");

        Ok(run.finish(tickers.len(), counts, Some(written)))
    }
}
