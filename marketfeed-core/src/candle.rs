//! Minute-bar candles and the newest-complete-bar selector.
//!
//! Chart providers return parallel arrays in which the most recent entries
//! are frequently null (the minute is still forming) or carry zero volume.
//! The selector scans newest to oldest for the first *complete* bar and then
//! validates it; it never clamps or repairs a bad bar.

use crate::timefmt::ReferenceZone;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal places kept on prices.
pub const PRICE_DECIMALS: u32 = 4;

/// Raw time series for one symbol, as returned by a chart provider.
///
/// The arrays are parallel to `timestamps`, but any of them may be shorter
/// than `timestamps` or hold nulls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    pub symbol: String,
    pub timestamps: Vec<i64>,
    pub open: Vec<Option<f64>>,
    pub high: Vec<Option<f64>>,
    pub low: Vec<Option<f64>>,
    pub close: Vec<Option<f64>>,
    pub volume: Vec<Option<u64>>,
}

/// One row of a series with every field present.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Row {
    ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl RawSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Row `i` if the timestamp and all five OHLCV fields are present.
    fn row(&self, i: usize) -> Option<Row> {
        Some(Row {
            ts: *self.timestamps.get(i)?,
            open: self.open.get(i).copied().flatten()?,
            high: self.high.get(i).copied().flatten()?,
            low: self.low.get(i).copied().flatten()?,
            close: self.close.get(i).copied().flatten()?,
            volume: self.volume.get(i).copied().flatten()?,
        })
    }
}

/// A validated OHLCV bar, prices rounded to [`PRICE_DECIMALS`].
///
/// Prices serialize as decimal strings, volume as an integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Plausible close-price range. Bars outside it are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for PriceBounds {
    fn default() -> Self {
        Self {
            min: 1.0,
            max: 100_000.0,
        }
    }
}

impl PriceBounds {
    pub fn contains(&self, price: f64) -> bool {
        self.min <= price && price <= self.max
    }
}

/// Why no candle was produced for a series. Never an error: the symbol is
/// simply skipped for this cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotFound {
    #[error("series has {0} bar(s), need at least 2")]
    TooFewBars(usize),

    #[error("no complete bar with volume > 0")]
    NoCompleteBar,

    #[error("close {close} outside [{min}, {max}]")]
    OutOfBounds { close: f64, min: f64, max: f64 },

    #[error("inconsistent bar: {0}")]
    Inconsistent(&'static str),

    #[error("bar at {0} is not representable")]
    Unrepresentable(i64),
}

impl NotFound {
    /// A bar was found but failed validation. Pipelines count this as a
    /// per-item failure; the other variants are expected-empty skips.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            NotFound::OutOfBounds { .. } | NotFound::Inconsistent(_) | NotFound::Unrepresentable(_)
        )
    }
}

/// Picks and validates the newest complete bar of a series.
#[derive(Debug, Clone, Default)]
pub struct CandleSelector {
    bounds: PriceBounds,
    zone: ReferenceZone,
}

impl CandleSelector {
    pub fn new(bounds: PriceBounds, zone: ReferenceZone) -> Self {
        Self { bounds, zone }
    }

    pub fn bounds(&self) -> PriceBounds {
        self.bounds
    }

    pub fn zone(&self) -> ReferenceZone {
        self.zone
    }

    /// Select the newest bar whose fields are all present and whose volume
    /// is positive, then validate it.
    ///
    /// Only the first candidate is considered; if it fails validation the
    /// whole series yields [`NotFound`].
    pub fn select(&self, series: &RawSeries) -> Result<Candle, NotFound> {
        if series.len() < 2 {
            return Err(NotFound::TooFewBars(series.len()));
        }

        let row = (0..series.len())
            .rev()
            .filter_map(|i| series.row(i))
            .find(|r| r.volume > 0)
            .ok_or(NotFound::NoCompleteBar)?;

        self.validate(&row)?;
        self.to_candle(&row)
    }

    /// Every complete row of the series, oldest first, without bound checks.
    ///
    /// Used for range collection, where the consumer wants the raw history
    /// (zero-volume minutes included) rather than a single live quote.
    pub fn complete_bars(&self, series: &RawSeries) -> Vec<Candle> {
        (0..series.len())
            .filter_map(|i| series.row(i))
            .filter_map(|r| self.to_candle(&r).ok())
            .collect()
    }

    fn validate(&self, row: &Row) -> Result<(), NotFound> {
        if !self.bounds.contains(row.close) {
            return Err(NotFound::OutOfBounds {
                close: row.close,
                min: self.bounds.min,
                max: self.bounds.max,
            });
        }
        if !(row.high >= row.low) {
            return Err(NotFound::Inconsistent("high < low"));
        }
        if !(row.high >= row.open) {
            return Err(NotFound::Inconsistent("high < open"));
        }
        if !(row.high >= row.close) {
            return Err(NotFound::Inconsistent("high < close"));
        }
        if !(row.low <= row.open) {
            return Err(NotFound::Inconsistent("low > open"));
        }
        if !(row.low <= row.close) {
            return Err(NotFound::Inconsistent("low > close"));
        }
        Ok(())
    }

    fn to_candle(&self, row: &Row) -> Result<Candle, NotFound> {
        let price = |v: f64| {
            Decimal::from_f64(v)
                .map(|d| d.round_dp(PRICE_DECIMALS))
                .ok_or(NotFound::Unrepresentable(row.ts))
        };
        Ok(Candle {
            timestamp: self
                .zone
                .format_unix(row.ts)
                .ok_or(NotFound::Unrepresentable(row.ts))?,
            open: price(row.open)?,
            high: price(row.high)?,
            low: price(row.low)?,
            close: price(row.close)?,
            volume: row.volume,
        })
    }
}
