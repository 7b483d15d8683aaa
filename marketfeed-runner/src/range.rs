//! Request/response range collection.
//!
//! A request file names a symbol and one of three modes:
//! - `{"symbol": "AAPL", "mode": "check_latest"}`: newest available bar time
//! - `{"symbol": "AAPL", "start_time": "...", "end_time": "..."}`: a window in
//!   the reference zone
//! - `{"symbol": "AAPL", "hours": 720}`: the trailing N hours
//!
//! The result is written to `../results/result_<stem>.json` next to the
//! request's directory. Failures produce an error result that is written too.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use marketfeed_core::data::{ChartSource, FetchError};
use marketfeed_core::snapshot::write_json_atomic;
use marketfeed_core::{run_with_retry, Candle, CandleSelector, RetryPolicy, SnapshotError, Sleeper, WrittenSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// How far back `check_latest` looks.
const CHECK_LATEST_LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum RangeError {
    #[error("cannot read request {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed request: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing 'symbol' in request")]
    MissingSymbol,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("cannot write result: {0}")]
    Write(#[from] SnapshotError),
}

/// Raw request file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeRequest {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub hours: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeMode {
    CheckLatest,
    Window { start: String, end: String },
    Hours(u32),
}

impl RangeRequest {
    pub fn load(path: &Path) -> Result<Self, RangeError> {
        let content = std::fs::read_to_string(path).map_err(|source| RangeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn symbol(&self) -> Result<&str, RangeError> {
        self.symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RangeError::MissingSymbol)
    }

    /// `check_latest` wins, then an explicit window, then trailing hours.
    pub fn mode(&self) -> Result<RangeMode, RangeError> {
        if self.mode.as_deref() == Some("check_latest") {
            return Ok(RangeMode::CheckLatest);
        }
        if let Some(start) = &self.start_time {
            let end = self
                .end_time
                .as_ref()
                .ok_or_else(|| RangeError::Invalid("'start_time' given without 'end_time'".into()))?;
            return Ok(RangeMode::Window {
                start: start.clone(),
                end: end.clone(),
            });
        }
        if let Some(hours) = self.hours {
            return Ok(RangeMode::Hours(hours));
        }
        Err(RangeError::Invalid(
            "missing 'mode', 'start_time'/'end_time' or 'hours'".into(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStatus {
    Success,
    Error,
}

/// Result file contents. Absent fields are omitted, except
/// `latest_timestamp`, which is `null` when no bar exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeResult {
    pub symbol: String,
    pub status: RangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<u32>,
    pub data: Vec<Candle>,
}

impl RangeResult {
    fn base(symbol: &str, status: RangeStatus) -> Self {
        Self {
            symbol: symbol.to_string(),
            status,
            mode: None,
            latest_timestamp: None,
            message: None,
            error: None,
            count: None,
            start_time: None,
            end_time: None,
            hours: None,
            data: Vec::new(),
        }
    }

    pub fn failure(symbol: &str, error: &RangeError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::base(symbol, RangeStatus::Error)
        }
    }

    fn bars(symbol: &str, data: Vec<Candle>) -> Self {
        let message = if data.is_empty() {
            "No data available for the specified range".to_string()
        } else {
            format!("Collected {} candles", data.len())
        };
        Self {
            message: Some(message),
            count: Some(data.len()),
            data,
            ..Self::base(symbol, RangeStatus::Success)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RangeStatus::Success
    }
}

/// `<dir>/../results/result_<stem>.json` for `<dir>/request_<stem>.json`.
pub fn result_path_for(request: &Path) -> PathBuf {
    let stem = request
        .file_stem()
        .map(|s| s.to_string_lossy().replace("request_", "result_"))
        .unwrap_or_else(|| "result".to_string());
    let base = request.parent().and_then(Path::parent).unwrap_or(Path::new(""));
    base.join("results").join(format!("{stem}.json"))
}

/// A written result and where it went.
#[derive(Debug)]
pub struct RangeRun {
    pub result: RangeResult,
    pub written: WrittenSnapshot,
}

pub struct RangeCollector<'a> {
    pub source: &'a dyn ChartSource,
    pub selector: CandleSelector,
    pub retry: RetryPolicy,
    pub sleeper: &'a dyn Sleeper,
}

impl<'a> RangeCollector<'a> {
    /// Process one request file end to end. Only a failure to write the
    /// result file itself is returned as an error.
    pub fn run_request_file(&self, request_path: &Path) -> Result<RangeRun, RangeError> {
        let result_path = result_path_for(request_path);
        info!(request = %request_path.display(), "range request");

        let request = RangeRequest::load(request_path);
        let symbol = request
            .as_ref()
            .ok()
            .and_then(|r| r.symbol().ok())
            .unwrap_or("UNKNOWN")
            .to_string();

        let result = match request.and_then(|r| self.collect(&r, Utc::now())) {
            Ok(result) => result,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "range request failed");
                RangeResult::failure(&symbol, &e)
            }
        };

        let written = write_json_atomic(&result_path, &result)?;
        info!(
            path = %written.path.display(),
            status = ?result.status,
            count = result.data.len(),
            "range result saved"
        );
        Ok(RangeRun { result, written })
    }

    /// Resolve and collect a request relative to `now`.
    pub fn collect(&self, request: &RangeRequest, now: DateTime<Utc>) -> Result<RangeResult, RangeError> {
        let symbol = request.symbol()?;
        match request.mode()? {
            RangeMode::CheckLatest => {
                let start = now - ChronoDuration::days(CHECK_LATEST_LOOKBACK_DAYS);
                let latest = self.fetch(symbol, start, now)?.and_then(|bars| bars.last().map(|c| c.timestamp.clone()));
                info!(symbol, latest = latest.as_deref().unwrap_or("-"), "latest available bar");
                Ok(RangeResult {
                    mode: Some("check_latest"),
                    latest_timestamp: Some(latest),
                    ..RangeResult::base(symbol, RangeStatus::Success)
                })
            }
            RangeMode::Window { start, end } => {
                let zone = self.selector.zone();
                let from = zone
                    .parse_local(&start)
                    .ok_or_else(|| RangeError::Invalid(format!("bad start_time '{start}'")))?;
                let to = zone
                    .parse_local(&end)
                    .ok_or_else(|| RangeError::Invalid(format!("bad end_time '{end}'")))?;
                if from >= to {
                    return Err(RangeError::Invalid(format!("start_time {start} is not before end_time {end}")));
                }
                let data = self.fetch(symbol, from, to)?.unwrap_or_default();
                Ok(RangeResult {
                    start_time: Some(start),
                    end_time: Some(end),
                    ..RangeResult::bars(symbol, data)
                })
            }
            RangeMode::Hours(hours) => {
                if hours == 0 {
                    return Err(RangeError::Invalid("'hours' must be positive".into()));
                }
                let data = self
                    .fetch(symbol, now - ChronoDuration::hours(i64::from(hours)), now)?
                    .unwrap_or_default();
                Ok(RangeResult {
                    hours: Some(hours),
                    ..RangeResult::bars(symbol, data)
                })
            }
        }
    }

    /// Complete bars in `[start, end)`, or `None` when the provider has none.
    fn fetch(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Option<Vec<Candle>>, RangeError> {
        let attempted = run_with_retry(&self.retry, self.sleeper, |_| self.source.range(symbol, start, end));
        match attempted.result {
            Ok(series) => {
                let bars = self.selector.complete_bars(&series);
                info!(symbol, raw = series.len(), kept = bars.len(), "range downloaded");
                Ok(Some(bars))
            }
            Err(e) if e.is_expected_empty() => {
                warn!(symbol, "no data available from provider");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
