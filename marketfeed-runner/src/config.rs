//! Collector configuration, loaded from an optional TOML file.
//!
//! Every section is `#[serde(default)]`, so an empty file (or no file at all)
//! yields the production defaults.

use marketfeed_core::data::YahooEndpoints;
use marketfeed_core::{Backoff, PacingPolicy, PriceBounds, ReferenceZone, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub provider: YahooEndpoints,
    pub candles: CandleConfig,
    pub retry: RetryPolicy,
    pub news: NewsConfig,
    pub fundamentals: FundamentalsConfig,
    pub backfill: BackfillConfig,
    pub paths: PathsConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            provider: YahooEndpoints::default(),
            candles: CandleConfig::default(),
            retry: RetryPolicy::default().with_throttle_wait(std::time::Duration::from_secs(10)),
            news: NewsConfig::default(),
            fundamentals: FundamentalsConfig::default(),
            backfill: BackfillConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

/// Minute-bar cycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandleConfig {
    /// IANA zone all output timestamps are rendered in.
    pub timezone: String,
    pub min_price: f64,
    pub max_price: f64,
    /// Worker pool size.
    pub concurrency: usize,
}

impl Default for CandleConfig {
    fn default() -> Self {
        let bounds = PriceBounds::default();
        Self {
            timezone: "Asia/Seoul".into(),
            min_price: bounds.min,
            max_price: bounds.max,
            concurrency: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    /// Articles requested per symbol.
    pub per_symbol: usize,
    pub search_concurrency: usize,
    /// Delay each search worker waits before its request.
    pub search_delay_ms: u64,
    pub crawl_pacing: PacingPolicy,
    /// Extra crawl attempts for a retryable extraction failure.
    pub crawl_retries: u32,
    /// Preventive session restart after this many articles.
    pub session_restart_every: usize,
    pub translation: TranslationConfig,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            per_symbol: 10,
            search_concurrency: 10,
            search_delay_ms: 100,
            crawl_pacing: PacingPolicy {
                base_delay_ms: 2_000,
                cooldown_every: 0,
                cooldown_ms: 0,
                error_delay_ms: 1_000,
                throttle_multiplier: 5,
            },
            crawl_retries: 1,
            session_restart_every: 100,
            translation: TranslationConfig::default(),
        }
    }
}

/// Chat-completions endpoint used for translation and summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
            max_tokens: 4_000,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalsConfig {
    pub pacing: PacingPolicy,
    pub retry: RetryPolicy,
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            pacing: PacingPolicy::default(),
            retry: RetryPolicy {
                max_retries: 2,
                backoff: Backoff::Fixed { delay_ms: 10_000 },
                throttle_wait_ms: 0,
            },
        }
    }
}

/// Bulk history load across every ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Trailing window loaded per symbol.
    pub hours: u32,
    pub pacing: PacingPolicy,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            hours: 720,
            pacing: PacingPolicy {
                base_delay_ms: 2_000,
                cooldown_every: 0,
                cooldown_ms: 0,
                error_delay_ms: 2_000,
                throttle_multiplier: 5,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// CSV with a `symbol` column (and optionally `name`).
    pub tickers: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tickers: PathBuf::from("nasdaq100_tickers.csv"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl PathsConfig {
    pub fn latest_snapshot(&self) -> PathBuf {
        self.output_dir.join("latest_data.json")
    }

    pub fn news_snapshot(&self) -> PathBuf {
        self.output_dir.join("news_details.json")
    }

    pub fn scan_snapshot(&self) -> PathBuf {
        self.output_dir.join("scanned_news.json")
    }

    /// `financial_data_<YYYYmmdd_HHMMSS>.json`; `stamp` is already formatted.
    pub fn fundamentals_snapshot(&self, stamp: &str) -> PathBuf {
        self.output_dir.join(format!("financial_data_{stamp}.json"))
    }

    pub fn backfill_summary(&self, stamp: &str) -> PathBuf {
        self.output_dir.join(format!("nasdaq100_load_{stamp}.json"))
    }
}

impl CollectorConfig {
    /// Load from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Environment values that override the file (`USER_AGENT`).
    pub fn apply_overrides(&mut self, user_agent: Option<String>) {
        if let Some(ua) = user_agent.filter(|ua| !ua.trim().is_empty()) {
            self.provider.user_agent = ua;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candles.concurrency == 0 {
            return Err(ConfigError::Invalid("candles.concurrency must be at least 1".into()));
        }
        if self.news.search_concurrency == 0 {
            return Err(ConfigError::Invalid("news.search_concurrency must be at least 1".into()));
        }
        if self.backfill.hours == 0 {
            return Err(ConfigError::Invalid("backfill.hours must be at least 1".into()));
        }
        if self.news.session_restart_every == 0 {
            return Err(ConfigError::Invalid("news.session_restart_every must be at least 1".into()));
        }
        let (min, max) = (self.candles.min_price, self.candles.max_price);
        if !(min.is_finite() && max.is_finite()) || min < 0.0 || min >= max {
            return Err(ConfigError::Invalid(format!(
                "price bounds must satisfy 0 <= min < max (got {min}..{max})"
            )));
        }
        self.zone()?;
        Ok(())
    }

    pub fn zone(&self) -> Result<ReferenceZone, ConfigError> {
        ReferenceZone::from_name(&self.candles.timezone)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown timezone '{}'", self.candles.timezone)))
    }

    pub fn bounds(&self) -> PriceBounds {
        PriceBounds {
            min: self.candles.min_price,
            max: self.candles.max_price,
        }
    }
}
