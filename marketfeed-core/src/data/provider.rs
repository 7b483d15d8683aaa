//! Collaborator traits and the structured error they return.
//!
//! The traits abstract over the finance data provider so pipelines can be
//! driven by scripted fakes in tests. Every failure is a [`FetchError`],
//! which knows whether it is retryable, a throttle signal, or an
//! expected-empty result.

use crate::candle::RawSeries;
use crate::news::NewsRecord;
use crate::retry::Classify;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("HTTP {status}: {context}")]
    Http { status: u16, context: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("no data for {symbol}")]
    NoData { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("external article: {url}")]
    ExternalArticle { url: String },

    #[error("content extraction failed: {0}")]
    Extraction(String),

    #[error("extraction session lost: {0}")]
    SessionLost(String),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl FetchError {
    /// Nothing to collect. Counted as a skip, never as a failure.
    pub fn is_expected_empty(&self) -> bool {
        matches!(self, FetchError::NoData { .. } | FetchError::ExternalArticle { .. })
    }
}

impl Classify for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::NetworkUnreachable(_)
            | FetchError::Timeout(_)
            | FetchError::RateLimited { .. }
            | FetchError::Extraction(_)
            | FetchError::SessionLost(_) => true,
            FetchError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn is_throttle(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

/// Intraday minute-bar source.
pub trait ChartSource: Send + Sync {
    fn name(&self) -> &str;

    /// The current trading day's minute bars.
    fn latest(&self, symbol: &str) -> Result<RawSeries, FetchError>;

    /// Minute bars between two instants.
    fn range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawSeries, FetchError>;

    /// False once the provider has blocked us (circuit breaker open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Per-symbol news search.
pub trait NewsSource: Send + Sync {
    /// Up to `count` article stubs for `symbol`, newest first.
    fn search(&self, symbol: &str, count: usize) -> Result<Vec<NewsRecord>, FetchError>;
}

/// One reporting period of a financial statement, snake_case line items
/// plus `fiscal_date`.
pub type StatementRow = BTreeMap<String, serde_json::Value>;

/// Newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementHistory {
    pub quarterly: Vec<StatementRow>,
    pub yearly: Vec<StatementRow>,
}

impl StatementHistory {
    pub fn is_empty(&self) -> bool {
        self.quarterly.is_empty() && self.yearly.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
    /// `YYYY-MM-DD`.
    pub payment_date: String,
    pub dividend_amount: f64,
}

/// Statements, key statistics, dividends and company profile for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    pub income_statement: StatementHistory,
    pub balance_sheet: StatementHistory,
    pub cashflow: StatementHistory,
    pub metrics: BTreeMap<String, Option<f64>>,
    /// Oldest first, most recent payments only.
    pub dividends: Vec<Dividend>,
    pub company_info: BTreeMap<String, serde_json::Value>,
}

pub trait FundamentalsSource: Send + Sync {
    fn fundamentals(&self, symbol: &str) -> Result<Fundamentals, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FetchError::Timeout("t".into()).is_retryable());
        assert!(FetchError::RateLimited { retry_after_secs: None }.is_throttle());
        assert!(FetchError::Http { status: 503, context: String::new() }.is_retryable());
        assert!(!FetchError::Http { status: 404, context: String::new() }.is_retryable());
        assert!(!FetchError::ResponseFormatChanged("x".into()).is_retryable());
        assert!(!FetchError::CircuitBreakerTripped.is_retryable());
        assert!(!FetchError::Translation("x".into()).is_retryable());
    }

    #[test]
    fn expected_empty_is_not_retryable() {
        let e = FetchError::NoData { symbol: "X".into() };
        assert!(e.is_expected_empty());
        assert!(!e.is_retryable());
        assert!(FetchError::ExternalArticle { url: "u".into() }.is_expected_empty());
    }
}
