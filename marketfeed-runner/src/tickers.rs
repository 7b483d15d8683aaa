//! Ticker list loading.
//!
//! The work list is a CSV with a `symbol` column and an optional `name`
//! column. Symbols are trimmed and upper-cased; blanks and duplicates are
//! dropped, first occurrence wins.

use marketfeed_core::WorkItem;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickerError {
    #[error("cannot read tickers from {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("no tickers in {}", .path.display())]
    Empty { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticker {
    pub symbol: String,
    pub name: Option<String>,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
        }
    }

    /// Market indices such as `^NDX` have no news or fundamentals.
    pub fn is_index(&self) -> bool {
        self.symbol.starts_with('^')
    }
}

impl WorkItem for Ticker {
    fn key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Deserialize)]
struct Row {
    symbol: String,
    #[serde(default)]
    name: Option<String>,
}

/// Load the ticker CSV at `path`. An unreadable or empty list is fatal.
pub fn load_tickers(path: &Path) -> Result<Vec<Ticker>, TickerError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| TickerError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
    collect(reader, path)
}

/// Parse tickers from any reader; `origin` is only used in errors.
pub fn parse_tickers<R: Read>(input: R, origin: &Path) -> Result<Vec<Ticker>, TickerError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);
    collect(reader, origin)
}

fn collect<R: Read>(mut reader: csv::Reader<R>, origin: &Path) -> Result<Vec<Ticker>, TickerError> {
    let mut seen = HashSet::new();
    let mut tickers = Vec::new();
    for row in reader.deserialize::<Row>() {
        let row = row.map_err(|source| TickerError::Csv {
            path: origin.to_path_buf(),
            source,
        })?;
        let symbol = row.symbol.trim().to_uppercase();
        if symbol.is_empty() || !seen.insert(symbol.clone()) {
            continue;
        }
        tickers.push(Ticker {
            symbol,
            name: row.name.filter(|n| !n.is_empty()),
        });
    }

    if tickers.is_empty() {
        return Err(TickerError::Empty {
            path: origin.to_path_buf(),
        });
    }
    Ok(tickers)
}

/// Drop market indices, keeping order.
pub fn without_indices(tickers: &[Ticker]) -> Vec<Ticker> {
    tickers.iter().filter(|t| !t.is_index()).cloned().collect()
}
