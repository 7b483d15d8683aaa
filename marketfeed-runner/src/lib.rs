//! Marketfeed Runner: collection pipelines built on `marketfeed-core`.
//!
//! This crate provides:
//! - TOML configuration with production defaults
//! - Ticker list loading
//! - The run lifecycle (state machine, report, fatal errors)
//! - The minute-bar cycle writing `latest_data.json`
//! - Request/response range collection
//! - The news pipeline (parallel search, sequential crawl and translate)
//! - The news date scan
//! - The fundamentals pipeline
//! - The bulk history backfill

pub mod backfill;
pub mod candles;
pub mod config;
pub mod fundamentals;
pub mod news;
pub mod orchestrator;
pub mod range;
pub mod tickers;

pub use backfill::{Backfill, BackfillSummary};
pub use candles::{collect_symbol, CandleCycle};
pub use config::{CollectorConfig, ConfigError};
pub use fundamentals::{FundamentalsDocument, FundamentalsPipeline, FundamentalsRecord};
pub use news::{
    load_scanned_day, ArticleSession, NewsInput, NewsPipeline, NewsScan, ScanError, ScannedNews, ScopedSession,
    SessionFactory, Translation, Translator, MAX_PER_SYMBOL,
};
pub use orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
pub use range::{result_path_for, RangeCollector, RangeError, RangeMode, RangeRequest, RangeResult, RangeStatus};
pub use tickers::{load_tickers, Ticker, TickerError};
