//! Yahoo Finance adapters.
//!
//! One blocking HTTP client serves three endpoints: the v8 chart API
//! (minute bars and dividend events), the v1 search API (news stubs) and
//! quoteSummary (statements, key statistics and profile). Each call is a single request; retries and pacing are
//! applied by the caller, so this layer only maps HTTP outcomes onto
//! [`FetchError`] and feeds the circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; shape mismatches surface as `ResponseFormatChanged`.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{
    ChartSource, Dividend, FetchError, Fundamentals, FundamentalsSource, NewsSource, StatementHistory, StatementRow,
};
use crate::candle::RawSeries;
use crate::news::NewsRecord;
use crate::timefmt::ReferenceZone;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    #[serde(default)]
    events: Option<ChartEvents>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartEvents {
    #[serde(default)]
    dividends: BTreeMap<String, DividendEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
}

/// v1 search response; only the news part is used.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    news: Vec<SearchNews>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNews {
    title: Option<String>,
    publisher: Option<String>,
    link: Option<String>,
    provider_publish_time: Option<i64>,
    thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    #[serde(default)]
    resolutions: Vec<Resolution>,
}

#[derive(Debug, Deserialize)]
struct Resolution {
    url: String,
    tag: Option<String>,
}

/// Thumbnail size the consumer lays out for.
const PREFERRED_THUMBNAIL: &str = "140x140";

/// quoteSummary modules requested for fundamentals.
const SUMMARY_MODULES: &str = "price,summaryDetail,defaultKeyStatistics,financialData,assetProfile,\
incomeStatementHistory,incomeStatementHistoryQuarterly,balanceSheetHistory,balanceSheetHistoryQuarterly,\
cashflowStatementHistory,cashflowStatementHistoryQuarterly";

/// (yearly module, quarterly module, list field) per statement.
const INCOME_MODULES: (&str, &str, &str) = (
    "incomeStatementHistory",
    "incomeStatementHistoryQuarterly",
    "incomeStatementHistory",
);
const BALANCE_MODULES: (&str, &str, &str) = (
    "balanceSheetHistory",
    "balanceSheetHistoryQuarterly",
    "balanceSheetStatements",
);
const CASHFLOW_MODULES: (&str, &str, &str) = (
    "cashflowStatementHistory",
    "cashflowStatementHistoryQuarterly",
    "cashflowStatements",
);

const QUARTERS_KEPT: usize = 12;
const YEARS_KEPT: usize = 4;
const DIVIDENDS_KEPT: usize = 20;

/// (output name, module, field) for every numeric metric.
const METRIC_FIELDS: &[(&str, &str, &str)] = &[
    ("profit_margins", "financialData", "profitMargins"),
    ("operating_margins", "financialData", "operatingMargins"),
    ("gross_margins", "financialData", "grossMargins"),
    ("ebitda_margins", "financialData", "ebitdaMargins"),
    ("return_on_equity", "financialData", "returnOnEquity"),
    ("return_on_assets", "financialData", "returnOnAssets"),
    ("revenue_growth", "financialData", "revenueGrowth"),
    ("earnings_growth", "financialData", "earningsGrowth"),
    ("earnings_quarterly_growth", "defaultKeyStatistics", "earningsQuarterlyGrowth"),
    ("current_ratio", "financialData", "currentRatio"),
    ("quick_ratio", "financialData", "quickRatio"),
    ("debt_to_equity", "financialData", "debtToEquity"),
    ("total_debt", "financialData", "totalDebt"),
    ("total_cash", "financialData", "totalCash"),
    ("trailing_pe", "summaryDetail", "trailingPE"),
    ("forward_pe", "summaryDetail", "forwardPE"),
    ("peg_ratio", "defaultKeyStatistics", "pegRatio"),
    ("price_to_book", "defaultKeyStatistics", "priceToBook"),
    ("enterprise_value", "defaultKeyStatistics", "enterpriseValue"),
    ("enterprise_to_revenue", "defaultKeyStatistics", "enterpriseToRevenue"),
    ("enterprise_to_ebitda", "defaultKeyStatistics", "enterpriseToEbitda"),
    ("trailing_eps", "defaultKeyStatistics", "trailingEps"),
    ("forward_eps", "defaultKeyStatistics", "forwardEps"),
    ("dividend_rate", "summaryDetail", "dividendRate"),
    ("dividend_yield", "summaryDetail", "dividendYield"),
    ("payout_ratio", "summaryDetail", "payoutRatio"),
    ("market_cap", "summaryDetail", "marketCap"),
    ("shares_outstanding", "defaultKeyStatistics", "sharesOutstanding"),
    ("float_shares", "defaultKeyStatistics", "floatShares"),
    ("shares_short", "defaultKeyStatistics", "sharesShort"),
    ("short_ratio", "defaultKeyStatistics", "shortRatio"),
    ("beta", "summaryDetail", "beta"),
    ("fifty_two_week_high", "summaryDetail", "fiftyTwoWeekHigh"),
    ("fifty_two_week_low", "summaryDetail", "fiftyTwoWeekLow"),
    ("fifty_day_average", "summaryDetail", "fiftyDayAverage"),
    ("two_hundred_day_average", "summaryDetail", "twoHundredDayAverage"),
];

/// (output name, module, field) for the company profile.
const PROFILE_FIELDS: &[(&str, &str, &str)] = &[
    ("long_name", "price", "longName"),
    ("short_name", "price", "shortName"),
    ("sector", "assetProfile", "sector"),
    ("industry", "assetProfile", "industry"),
    ("industry_key", "assetProfile", "industryKey"),
    ("sector_key", "assetProfile", "sectorKey"),
    ("country", "assetProfile", "country"),
    ("city", "assetProfile", "city"),
    ("state", "assetProfile", "state"),
    ("address", "assetProfile", "address1"),
    ("zip_code", "assetProfile", "zip"),
    ("website", "assetProfile", "website"),
    ("phone", "assetProfile", "phone"),
    ("full_time_employees", "assetProfile", "fullTimeEmployees"),
    ("long_business_summary", "assetProfile", "longBusinessSummary"),
    ("market_cap", "price", "marketCap"),
    ("enterprise_value", "defaultKeyStatistics", "enterpriseValue"),
];

/// Base URLs, overridable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YahooEndpoints {
    pub chart: String,
    pub search: String,
    pub quote_summary: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for YahooEndpoints {
    fn default() -> Self {
        Self {
            chart: "https://query1.finance.yahoo.com/v8/finance/chart".into(),
            search: "https://query1.finance.yahoo.com/v1/finance/search".into(),
            quote_summary: "https://query2.finance.yahoo.com/v10/finance/quoteSummary".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".into(),
            timeout_secs: 10,
        }
    }
}

/// Yahoo Finance client implementing the chart, news and fundamentals sources.
pub struct YahooClient {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    endpoints: YahooEndpoints,
    zone: ReferenceZone,
}

impl YahooClient {
    pub fn new(
        endpoints: YahooEndpoints,
        circuit_breaker: Arc<CircuitBreaker>,
        zone: ReferenceZone,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(endpoints.timeout_secs))
            .user_agent(endpoints.user_agent.clone())
            .build()
            .map_err(|e| FetchError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            endpoints,
            zone,
        })
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    fn latest_url(&self, symbol: &str) -> String {
        format!("{}/{symbol}?interval=1m&range=1d", self.endpoints.chart)
    }

    fn range_url(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "{}/{symbol}?interval=1m&period1={}&period2={}",
            self.endpoints.chart,
            start.timestamp(),
            end.timestamp()
        )
    }

    fn search_url(&self, symbol: &str, count: usize) -> String {
        format!(
            "{}?q={symbol}&newsCount={count}&quotesCount=0",
            self.endpoints.search
        )
    }

    fn dividends_url(&self, symbol: &str) -> String {
        format!("{}/{symbol}?interval=1d&range=max&events=div", self.endpoints.chart)
    }

    /// The most recent dividend payments, oldest first.
    pub fn dividends(&self, symbol: &str) -> Result<Vec<Dividend>, FetchError> {
        let resp: ChartResponse = self.get_json(symbol, &self.dividends_url(symbol))?;
        parse_dividends(resp)
    }

    fn summary_url(&self, symbol: &str) -> String {
        format!(
            "{}/{symbol}?modules={SUMMARY_MODULES}",
            self.endpoints.quote_summary
        )
    }

    /// One GET, mapped onto `FetchError` with circuit breaker bookkeeping.
    fn get_json<T: DeserializeOwned>(&self, symbol: &str, url: &str) -> Result<T, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        debug!(symbol, url, "GET");
        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(format!("{symbol}: {e}"))
            } else {
                FetchError::NetworkUnreachable(format!("{symbol}: {e}"))
            }
        })?;

        let status = resp.status();

        if status == reqwest::StatusCode::FORBIDDEN {
            // IP ban: trip the circuit breaker
            self.circuit_breaker.trip();
            return Err(FetchError::CircuitBreakerTripped);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(FetchError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NoData {
                symbol: symbol.to_string(),
            });
        }

        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                context: symbol.to_string(),
            });
        }

        let parsed = resp.json::<T>().map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(format!("{symbol}: {e}"))
            } else {
                FetchError::ResponseFormatChanged(format!(
                    "failed to parse response for {symbol}: {e}"
                ))
            }
        })?;
        self.circuit_breaker.record_success();
        Ok(parsed)
    }
}

/// Chart response → raw parallel arrays. An empty result is `NoData`.
fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<RawSeries, FetchError> {
    let no_data = || FetchError::NoData {
        symbol: symbol.to_string(),
    };

    let results = match (resp.chart.result, resp.chart.error) {
        (Some(results), _) => results,
        (None, Some(err)) if err.code == "Not Found" => return Err(no_data()),
        (None, Some(err)) => {
            return Err(FetchError::ResponseFormatChanged(format!(
                "{}: {}",
                err.code,
                err.description.unwrap_or_default()
            )))
        }
        (None, None) => return Err(no_data()),
    };

    let data = results.into_iter().next().ok_or_else(no_data)?;
    let timestamps = match data.timestamp {
        Some(ts) if !ts.is_empty() => ts,
        _ => return Err(no_data()),
    };
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::ResponseFormatChanged("no quote data".into()))?;

    Ok(RawSeries {
        symbol: symbol.to_string(),
        timestamps,
        open: quote.open,
        high: quote.high,
        low: quote.low,
        close: quote.close,
        volume: quote.volume,
    })
}

/// Dividend events → the last `DIVIDENDS_KEPT` payments. No events, or an
/// unknown symbol, is an empty list.
fn parse_dividends(resp: ChartResponse) -> Result<Vec<Dividend>, FetchError> {
    let data = match (resp.chart.result, resp.chart.error) {
        (Some(results), _) => match results.into_iter().next() {
            Some(data) => data,
            None => return Ok(Vec::new()),
        },
        (None, Some(err)) if err.code != "Not Found" => {
            return Err(FetchError::ResponseFormatChanged(format!(
                "{}: {}",
                err.code,
                err.description.unwrap_or_default()
            )))
        }
        (None, _) => return Ok(Vec::new()),
    };

    let mut events: Vec<DividendEvent> = data
        .events
        .map(|e| e.dividends.into_values().collect())
        .unwrap_or_default();
    events.sort_by_key(|e| e.date);
    let skip = events.len().saturating_sub(DIVIDENDS_KEPT);
    Ok(events
        .into_iter()
        .skip(skip)
        .filter_map(|e| {
            let paid = DateTime::from_timestamp(e.date, 0)?;
            Some(Dividend {
                payment_date: paid.format("%Y-%m-%d").to_string(),
                dividend_amount: e.amount,
            })
        })
        .collect())
}

/// Search response → news stubs. Stubs without a link are dropped.
fn parse_search(symbol: &str, resp: SearchResponse, count: usize, zone: ReferenceZone) -> Vec<NewsRecord> {
    resp.news
        .into_iter()
        .filter_map(|n| {
            let url = n.link.filter(|l| !l.is_empty())?;
            let thumbnail_url = n.thumbnail.and_then(|t| {
                let preferred = t
                    .resolutions
                    .iter()
                    .position(|r| r.tag.as_deref() == Some(PREFERRED_THUMBNAIL))
                    .unwrap_or(0);
                t.resolutions.into_iter().nth(preferred).map(|r| r.url)
            });
            let published_at = n
                .provider_publish_time
                .and_then(|ts| zone.format_unix(ts))
                .unwrap_or_else(|| zone.now());

            Some(NewsRecord {
                symbol: Some(symbol.to_string()),
                title: n.title.unwrap_or_else(|| "No Title".into()),
                url,
                publisher: n.publisher.unwrap_or_else(|| "Unknown".into()),
                published_at,
                thumbnail_url,
                summary: None,
                encoded_body: None,
            })
        })
        .take(count)
        .collect()
}

/// Yahoo wraps numbers as `{"raw": 1.0, "fmt": "1.00"}`; plain numbers are accepted too.
fn raw_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Object(o) => o.get("raw").and_then(Value::as_f64),
        _ => None,
    }
}

fn raw_value(v: &Value) -> Value {
    match v {
        Value::Object(o) => o.get("raw").cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// `totalRevenue` → `total_revenue`.
fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `endDate` as `YYYY-MM-DD`, from `fmt` or the raw epoch seconds.
fn fiscal_date(v: &Value) -> Value {
    if let Some(fmt) = v.get("fmt").and_then(Value::as_str) {
        return Value::String(fmt.to_string());
    }
    raw_number(v)
        .and_then(|ts| DateTime::from_timestamp(ts as i64, 0))
        .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn statement_row(row: &Value) -> StatementRow {
    let Some(fields) = row.as_object() else {
        return StatementRow::new();
    };
    fields
        .iter()
        .filter(|(key, _)| key.as_str() != "maxAge")
        .map(|(key, value)| match key.as_str() {
            "endDate" => ("fiscal_date".to_string(), fiscal_date(value)),
            _ => (snake_case(key), raw_value(value)),
        })
        .collect()
}

fn statement_rows(result: &Value, module: &str, list: &str, keep: usize) -> Vec<StatementRow> {
    result
        .get(module)
        .and_then(|m| m.get(list))
        .and_then(Value::as_array)
        .map(|rows| rows.iter().take(keep).map(statement_row).collect())
        .unwrap_or_default()
}

fn statement_history(result: &Value, (yearly, quarterly, list): (&str, &str, &str)) -> StatementHistory {
    StatementHistory {
        quarterly: statement_rows(result, quarterly, list, QUARTERS_KEPT),
        yearly: statement_rows(result, yearly, list, YEARS_KEPT),
    }
}

/// quoteSummary response → statements, flattened metrics and profile.
fn parse_summary(symbol: &str, resp: &Value) -> Result<Fundamentals, FetchError> {
    let summary = resp
        .get("quoteSummary")
        .ok_or_else(|| FetchError::ResponseFormatChanged("missing quoteSummary".into()))?;

    if let Some(err) = summary.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(Value::as_str).unwrap_or_default();
        if code == "Not Found" {
            return Err(FetchError::NoData {
                symbol: symbol.to_string(),
            });
        }
        return Err(FetchError::ResponseFormatChanged(err.to_string()));
    }

    let result = summary
        .get("result")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .ok_or_else(|| FetchError::NoData {
            symbol: symbol.to_string(),
        })?;

    let field = |module: &str, key: &str| result.get(module).and_then(|m| m.get(key));

    let metrics: BTreeMap<String, Option<f64>> = METRIC_FIELDS
        .iter()
        .map(|(name, module, key)| (name.to_string(), field(module, key).and_then(raw_number)))
        .collect();

    let company_info: BTreeMap<String, Value> = PROFILE_FIELDS
        .iter()
        .map(|(name, module, key)| {
            (
                name.to_string(),
                field(module, key).map(raw_value).unwrap_or(Value::Null),
            )
        })
        .collect();

    Ok(Fundamentals {
        income_statement: statement_history(result, INCOME_MODULES),
        balance_sheet: statement_history(result, BALANCE_MODULES),
        cashflow: statement_history(result, CASHFLOW_MODULES),
        metrics,
        dividends: Vec::new(),
        company_info,
    })
}

impl ChartSource for YahooClient {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn latest(&self, symbol: &str) -> Result<RawSeries, FetchError> {
        let resp: ChartResponse = self.get_json(symbol, &self.latest_url(symbol))?;
        parse_chart(symbol, resp)
    }

    fn range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawSeries, FetchError> {
        let resp: ChartResponse = self.get_json(symbol, &self.range_url(symbol, start, end))?;
        parse_chart(symbol, resp)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl NewsSource for YahooClient {
    fn search(&self, symbol: &str, count: usize) -> Result<Vec<NewsRecord>, FetchError> {
        let resp: SearchResponse = self.get_json(symbol, &self.search_url(symbol, count))?;
        Ok(parse_search(symbol, resp, count, self.zone))
    }
}

impl FundamentalsSource for YahooClient {
    fn fundamentals(&self, symbol: &str) -> Result<Fundamentals, FetchError> {
        let resp: Value = self.get_json(symbol, &self.summary_url(symbol))?;
        let mut fundamentals = parse_summary(symbol, &resp)?;
        // Dividends are optional; only a ban aborts the symbol.
        fundamentals.dividends = match self.dividends(symbol) {
            Ok(dividends) => dividends,
            Err(FetchError::CircuitBreakerTripped) => return Err(FetchError::CircuitBreakerTripped),
            Err(e) => {
                warn!(symbol, error = %e, "dividends unavailable");
                Vec::new()
            }
        };
        Ok(fundamentals)
    }
}
