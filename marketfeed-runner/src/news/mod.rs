//! News pipeline.
//!
//! Stage 1 searches every ticker in parallel and deduplicates the article
//! stubs by URL. Stage 2 walks the stubs strictly sequentially through one
//! extraction session: crawl, translate, encode. Only fully processed
//! articles reach `news_details.json`.
//!
//! Stage 1 can be replaced by one day of a previous date scan
//! (`scanned_news.json`), see [`scan`].

pub mod extract;
pub mod scan;
pub mod session;
pub mod translate;

pub use extract::{extract_article, HttpArticleSession, HttpSessionFactory};
pub use scan::{load_scanned_day, NewsScan, ScanError, ScannedNews};
pub use session::{ArticleSession, ScopedSession, SessionFactory};
pub use translate::{OpenAiTranslator, Translation, Translator};

use marketfeed_core::data::{FetchError, NewsSource};
use marketfeed_core::news::{encode_body, ArticleBody, NewsRecord};
use marketfeed_core::Classify;
use marketfeed_core::{
    dedupe, dispatch, run_with_retry, Backoff, DispatchError, NoProgress, Outcome, OutcomeCounts, Pacer,
    Progress, ReferenceZone, RetryPolicy, SnapshotWriter, Sleeper,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, ConfigError, NewsConfig};
use crate::orchestrator::{Run, RunContext, RunError, RunFailure, RunReport, RunState};
use crate::tickers::{load_tickers, without_indices, Ticker, TickerError};

/// Delay between crawl attempts of the same article.
const CRAWL_RETRY_DELAY_MS: u64 = 2_000;

/// Upper bound of `newsCount` the search endpoint honours.
pub const MAX_PER_SYMBOL: usize = 10;

/// Where the article stubs come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewsInput {
    /// Every stock in the ticker CSV, indices excluded.
    TickerList,
    /// An explicit list given on the command line.
    Symbols(Vec<Ticker>),
    /// One date of a previous scan; the search stage is skipped.
    Scanned { path: PathBuf, date: String },
}

#[derive(Debug, Serialize)]
struct NewsDocument<'a> {
    timestamp: String,
    total_news: usize,
    data: &'a [NewsRecord],
}

pub struct NewsPipeline<'a> {
    pub search: &'a dyn NewsSource,
    pub sessions: &'a dyn SessionFactory,
    pub translator: &'a dyn Translator,
    pub config: NewsConfig,
    /// Retry policy for the search stage.
    pub retry: RetryPolicy,
    pub zone: ReferenceZone,
    pub input: NewsInput,
    pub tickers: PathBuf,
    pub snapshot: PathBuf,
}

impl<'a> NewsPipeline<'a> {
    pub fn from_config(
        config: &CollectorConfig,
        search: &'a dyn NewsSource,
        sessions: &'a dyn SessionFactory,
        translator: &'a dyn Translator,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            search,
            sessions,
            translator,
            config: config.news.clone(),
            retry: config.retry,
            zone: config.zone()?,
            input: NewsInput::TickerList,
            tickers: config.paths.tickers.clone(),
            snapshot: config.paths.news_snapshot(),
        })
    }

    pub fn with_input(mut self, input: NewsInput) -> Self {
        self.input = input;
        self
    }

    /// Articles requested per symbol, clamped to `1..=MAX_PER_SYMBOL`.
    pub fn with_per_symbol(mut self, count: usize) -> Self {
        self.config.per_symbol = count.clamp(1, MAX_PER_SYMBOL);
        self
    }

    pub fn run(&self, ctx: &RunContext<'_>) -> Result<RunReport, RunFailure> {
        let mut run = Run::start("news");

        run.advance(RunState::LoadingItems);
        let stubs = match &self.input {
            NewsInput::Scanned { path, date } => {
                let stubs = load_scanned_day(path, date).map_err(|e| run.fail(e, OutcomeCounts::default()))?;
                info!(%date, count = stubs.len(), "loaded scanned news");
                run.advance(RunState::Dispatching);
                stubs
            }
            input => {
                let tickers = self
                    .search_targets(input)
                    .map_err(|e| run.fail(e, OutcomeCounts::default()))?;
                run.advance(RunState::Dispatching);
                self.search_all(&tickers, ctx)
                    .map_err(|e| run.fail(e, OutcomeCounts::default()))?
            }
        };

        let requested = stubs.len();
        let (processed, counts) = self
            .crawl_all(stubs, ctx)
            .map_err(|e| run.fail(RunError::Session(e), OutcomeCounts::default()))?;

        run.advance(RunState::Aggregating);
        if ctx.is_cancelled() {
            return Err(run.fail(RunError::Interrupted, counts));
        }
        if requested == 0 {
            info!("no news to collect; previous snapshot kept");
            run.advance(RunState::Writing);
            return Ok(run.finish(0, counts, None));
        }
        let doc = NewsDocument {
            timestamp: self.zone.now(),
            total_news: processed.len(),
            data: &processed,
        };

        run.advance(RunState::Writing);
        let written = SnapshotWriter::new(&self.snapshot)
            .write_document(processed.len(), &doc)
            .map_err(|e| run.fail(e, counts))?;
        info!(path = %written.path.display(), total = processed.len(), "news saved");

        Ok(run.finish(requested, counts, Some(written)))
    }

    /// Symbols to search: the explicit list, or the stocks of the ticker CSV.
    fn search_targets(&self, input: &NewsInput) -> Result<Vec<Ticker>, TickerError> {
        let (tickers, origin) = match input {
            NewsInput::Symbols(tickers) => (tickers.clone(), PathBuf::from("--symbols")),
            _ => (without_indices(&load_tickers(&self.tickers)?), self.tickers.clone()),
        };
        if tickers.is_empty() {
            return Err(TickerError::Empty { path: origin });
        }
        Ok(tickers)
    }

    /// Stage 1: search every ticker, flatten in ticker order, dedupe by URL.
    pub fn search_all(&self, tickers: &[Ticker], ctx: &RunContext<'_>) -> Result<Vec<NewsRecord>, DispatchError> {
        search_tickers(self.search, &self.config, &self.retry, tickers, ctx, &NoProgress).map(|(stubs, _)| stubs)
    }

    /// Stage 2: crawl, translate and encode each article in order.
    ///
    /// Stops early on interrupt; the session is closed either way. Only a
    /// session that cannot be opened at all is an error.
    pub fn crawl_all(
        &self,
        records: Vec<NewsRecord>,
        ctx: &RunContext<'_>,
    ) -> Result<(Vec<NewsRecord>, OutcomeCounts), FetchError> {
        let total = records.len();
        let mut processed = Vec::new();
        let mut counts = OutcomeCounts::default();
        if total == 0 {
            return Ok((processed, counts));
        }

        let mut session = ScopedSession::open(self.sessions, self.config.session_restart_every)?;
        let mut pacer = Pacer::new(self.config.crawl_pacing);
        let retry = pacer.escalate(RetryPolicy {
            max_retries: self.config.crawl_retries,
            backoff: Backoff::Fixed {
                delay_ms: CRAWL_RETRY_DELAY_MS,
            },
            throttle_wait_ms: 0,
        });

        for (index, record) in records.into_iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(done = index, total, "interrupted; stopping crawl");
                break;
            }
            ctx.sleeper.sleep(pacer.before_each(index, total));

            let key = record.symbol.clone().unwrap_or_else(|| "N/A".into());
            info!(
                "[{}/{}] {}: {}",
                index + 1,
                total,
                key,
                record.title.chars().take(50).collect::<String>()
            );

            let restarts = session.restarts();
            let outcome = self.process_article(&mut session, record, &retry, ctx.sleeper, &pacer);
            if session.restarts() > restarts {
                ctx.sleeper.sleep(ScopedSession::settle_delay());
            }

            let kind = outcome.kind();
            match outcome {
                Outcome::Success(record) => processed.push(record),
                Outcome::Skipped(reason) => info!(%reason, "article skipped"),
                Outcome::Failed(reason) => {
                    warn!(%reason, "article failed");
                    pacer.record_failure();
                }
            }
            counts.record(kind);
            ctx.progress.on_item(&key, index + 1, total, kind);
            session.article_done();
        }

        info!(
            succeeded = counts.succeeded,
            skipped = counts.skipped,
            failed = counts.failed,
            restarts = session.restarts(),
            "crawl complete"
        );
        Ok((processed, counts))
    }

    fn process_article(
        &self,
        session: &mut ScopedSession<'_>,
        record: NewsRecord,
        retry: &RetryPolicy,
        sleeper: &dyn Sleeper,
        pacer: &Pacer,
    ) -> Outcome<NewsRecord> {
        if record.url.is_empty() {
            return Outcome::Failed("article has no URL".into());
        }

        let attempted = run_with_retry(retry, sleeper, |_| session.extract(&record.url));
        let content = match attempted.result {
            Ok(content) => content,
            Err(e) if e.is_expected_empty() => return Outcome::Skipped(e.to_string()),
            Err(e) => {
                // Throttles answered by a retry already waited inside the executor.
                if e.is_throttle() {
                    sleeper.sleep(pacer.on_throttle_signal());
                }
                return Outcome::Failed(format!("crawl: {e} (after {} attempts)", attempted.attempts));
            }
        };
        debug!(url = %record.url, chars = content.len(), "crawled");

        let translation = match self.translator.translate(&record.title, &content) {
            Ok(t) => t,
            Err(e) => {
                if e.is_throttle() {
                    sleeper.sleep(pacer.on_throttle_signal());
                }
                return Outcome::Failed(format!("translate: {e}"));
            }
        };

        let body = ArticleBody {
            url: record.url.clone(),
            summary: translation.summary.clone(),
            publisher: record.publisher.clone(),
            full_content: translation.translated_content,
        };
        match encode_body(&body) {
            Ok(encoded) => Outcome::Success(record.with_body(translation.summary, encoded)),
            Err(e) => Outcome::Failed(format!("encode: {e}")),
        }
    }
}

/// Search every ticker in parallel and dedupe the stubs by URL, keeping
/// ticker order. Returns the stubs and the per-ticker outcome tallies.
pub fn search_tickers(
    search: &dyn NewsSource,
    config: &NewsConfig,
    retry: &RetryPolicy,
    tickers: &[Ticker],
    ctx: &RunContext<'_>,
    progress: &dyn Progress,
) -> Result<(Vec<NewsRecord>, OutcomeCounts), DispatchError> {
    let delay = Duration::from_millis(config.search_delay_ms);
    let per_symbol = config.per_symbol.clamp(1, MAX_PER_SYMBOL);
    let mut outcomes = dispatch(tickers, config.search_concurrency, progress, |ticker| {
        if ctx.is_cancelled() {
            return Outcome::Skipped("interrupted".into());
        }
        ctx.sleeper.sleep(delay);
        let attempted = run_with_retry(retry, ctx.sleeper, |_| search.search(&ticker.symbol, per_symbol));
        match attempted.result {
            Ok(stubs) if stubs.is_empty() => Outcome::Skipped("no news".into()),
            Ok(stubs) => {
                debug!(symbol = %ticker.symbol, count = stubs.len(), "news found");
                Outcome::Success(stubs)
            }
            Err(e) if e.is_expected_empty() => Outcome::Skipped(e.to_string()),
            Err(e) => {
                warn!(symbol = %ticker.symbol, attempts = attempted.attempts, error = %e, "news search failed");
                Outcome::Failed(e.to_string())
            }
        }
    })?;

    let counts = OutcomeCounts::from_outcomes(outcomes.values());
    let stubs: Vec<NewsRecord> = tickers
        .iter()
        .filter_map(|t| outcomes.remove(&t.symbol))
        .filter_map(Outcome::success)
        .flatten()
        .collect();
    let (unique, stats) = dedupe(stubs);
    info!(
        symbols = tickers.len(),
        with_news = counts.succeeded,
        failed = counts.failed,
        found = stats.input_count,
        unique = stats.output_count,
        duplicates = stats.removed_count,
        "news search complete"
    );
    Ok((unique, counts))
}
