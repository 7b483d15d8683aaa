use chrono::{DateTime, Utc};
use marketfeed_core::data::{ChartSource, FetchError};
use marketfeed_core::{Backoff, CandleSelector, OutcomeKind, Progress, RawSeries, RetryPolicy, Sleeper};
use marketfeed_runner::{CandleCycle, RunContext, RunError, RunState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _: Duration) {}
}

#[derive(Default)]
struct RecordingProgress(Mutex<Vec<(String, usize, usize)>>);

impl Progress for RecordingProgress {
    fn on_item(&self, key: &str, done: usize, total: usize, _kind: OutcomeKind) {
        self.0.lock().unwrap().push((key.to_string(), done, total));
    }
}

/// Per-symbol scripted responses; the last response repeats.
struct ScriptedChart(Mutex<HashMap<String, Vec<Result<RawSeries, FetchError>>>>);

impl ScriptedChart {
    fn new(entries: Vec<(&str, Vec<Result<RawSeries, FetchError>>)>) -> Self {
        Self(Mutex::new(
            entries.into_iter().map(|(s, r)| (s.to_string(), r)).collect(),
        ))
    }
}

impl ChartSource for ScriptedChart {
    fn name(&self) -> &str {
        "scripted"
    }

    fn latest(&self, symbol: &str) -> Result<RawSeries, FetchError> {
        let mut map = self.0.lock().unwrap();
        let queue = map
            .get_mut(symbol)
            .ok_or_else(|| FetchError::NoData { symbol: symbol.to_string() })?;
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue[0].clone()
        }
    }

    fn range(&self, symbol: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<RawSeries, FetchError> {
        Err(FetchError::NoData { symbol: symbol.to_string() })
    }
}

fn bar(symbol: &str, open: f64, high: f64, low: f64, close: f64) -> RawSeries {
    RawSeries {
        symbol: symbol.into(),
        timestamps: vec![1_700_000_000, 1_700_000_060, 1_700_000_120],
        open: vec![Some(open), Some(open), None],
        high: vec![Some(high), Some(high), None],
        low: vec![Some(low), Some(low), None],
        close: vec![Some(close), Some(close), None],
        volume: vec![Some(100), Some(250), None],
    }
}

fn timeout() -> Result<RawSeries, FetchError> {
    Err(FetchError::Timeout("read timed out".into()))
}

fn cycle<'a>(source: &'a ScriptedChart, dir: &Path) -> CandleCycle<'a> {
    CandleCycle {
        source,
        selector: CandleSelector::default(),
        retry: RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed { delay_ms: 0 },
            throttle_wait_ms: 0,
        },
        concurrency: 4,
        tickers: dir.join("tickers.csv"),
        snapshot: dir.join("output").join("latest_data.json"),
    }
}

fn write_tickers(dir: &Path, symbols: &[&str]) {
    let mut csv = String::from("symbol,name\n");
    for s in symbols {
        csv.push_str(&format!("{s},{s} Corp\n"));
    }
    std::fs::write(dir.join("tickers.csv"), csv).unwrap();
}

#[test]
fn end_to_end_valid_invalid_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    write_tickers(dir.path(), &["A", "B", "C"]);
    let source = ScriptedChart::new(vec![
        ("A", vec![Ok(bar("A", 10.0, 11.0, 9.5, 10.5))]),
        // high < low: rejected, counted as a failure
        ("B", vec![Ok(bar("B", 10.0, 9.0, 11.0, 10.0))]),
        ("C", vec![timeout(), timeout(), Ok(bar("C", 20.0, 21.0, 19.0, 20.25))]),
    ]);
    let progress = RecordingProgress::default();
    let ctx = RunContext::new(&NoSleep, &progress);

    let report = cycle(&source, dir.path()).run(&ctx).unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.requested, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 0);

    let path = report.snapshot.clone().unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(report.snapshot_hash.as_ref().map(String::len), Some(64));

    let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let data = doc["data"].as_object().unwrap();
    assert_eq!(data.keys().collect::<Vec<_>>(), ["A", "C"]);
    assert_eq!(data["A"]["close"], "10.5");
    assert_eq!(data["A"]["volume"], 250);
    assert_eq!(data["C"]["close"], "20.25");
    assert_eq!(data["C"]["timestamp"], "2023-11-15 07:14:20");
    assert_eq!(doc["timestamp"].as_str().unwrap().len(), 19);

    let mut seen = progress.0.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, _, total)| *total == 3));
    let mut done: Vec<_> = seen.iter().map(|(_, d, _)| *d).collect();
    done.sort();
    assert_eq!(done, [1, 2, 3]);
}

#[test]
fn empty_aggregate_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    write_tickers(dir.path(), &["A", "B"]);
    let snapshot = dir.path().join("output").join("latest_data.json");
    std::fs::create_dir_all(snapshot.parent().unwrap()).unwrap();
    let previous = br#"{"timestamp":"2025-12-24 00:13:00","data":{"A":{}}}"#;
    std::fs::write(&snapshot, previous).unwrap();

    let source = ScriptedChart::new(vec![
        ("A", vec![Err(FetchError::NoData { symbol: "A".into() })]),
        ("B", vec![Ok(RawSeries::default())]),
    ]);
    let failure = cycle(&source, dir.path())
        .run(&RunContext::new(&NoSleep, &marketfeed_core::NoProgress))
        .unwrap_err();

    assert_eq!(failure.state, RunState::Writing);
    assert!(matches!(failure.error, RunError::SnapshotRefused { .. }));
    assert_eq!(failure.counts.skipped, 2);
    assert_eq!(std::fs::read(&snapshot).unwrap(), previous.to_vec());
}

#[test]
fn unreadable_ticker_list_fails_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedChart::new(Vec::new());
    let progress = RecordingProgress::default();

    let failure = cycle(&source, dir.path())
        .run(&RunContext::new(&NoSleep, &progress))
        .unwrap_err();

    assert_eq!(failure.state, RunState::LoadingItems);
    assert!(matches!(failure.error, RunError::LoadItems(_)));
    assert!(progress.0.lock().unwrap().is_empty());
    assert!(!dir.path().join("output").exists());
}

#[test]
fn one_symbol_always_failing_does_not_stop_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let symbols: Vec<String> = (0..12).map(|i| format!("S{i}")).collect();
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    write_tickers(dir.path(), &refs);

    let mut entries: Vec<(&str, Vec<Result<RawSeries, FetchError>>)> = refs
        .iter()
        .map(|s| (*s, vec![Ok(bar(s, 5.0, 6.0, 4.0, 5.5))]))
        .collect();
    entries[7].1 = vec![Err(FetchError::ResponseFormatChanged("unexpected shape".into()))];
    let source = ScriptedChart::new(entries);

    let report = cycle(&source, dir.path())
        .run(&RunContext::new(&NoSleep, &marketfeed_core::NoProgress))
        .unwrap();
    assert_eq!(report.succeeded, 11);
    assert_eq!(report.failed, 1);

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report.snapshot.unwrap()).unwrap()).unwrap();
    assert_eq!(doc["data"].as_object().unwrap().len(), 11);
    assert!(doc["data"].get("S7").is_none());
}

#[test]
fn cancelled_cycle_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    write_tickers(dir.path(), &["A"]);
    let source = ScriptedChart::new(vec![("A", vec![Ok(bar("A", 10.0, 11.0, 9.5, 10.5))])]);
    let cancel = std::sync::atomic::AtomicBool::new(true);
    let ctx = RunContext::new(&NoSleep, &marketfeed_core::NoProgress).with_cancel(&cancel);

    let failure = cycle(&source, dir.path()).run(&ctx).unwrap_err();
    assert!(matches!(failure.error, RunError::Interrupted));
    assert!(!dir.path().join("output").exists());
}
