//! Marketfeed CLI: batch collection commands.
//!
//! Commands:
//! - `candles`: one minute-bar cycle, or `--loop` on every minute boundary
//! - `history`: answer a range/latest request file with a result file
//! - `news`: search, crawl, translate and encode recent articles
//! - `scan`: group recent news stubs by publication date
//! - `fundamentals`: key statistics, statements and dividends per symbol
//! - `backfill`: load a trailing window of minute bars for every ticker

use anyhow::{bail, Context, Result};
use chrono::{Timelike, Utc};
use clap::{Parser, Subcommand};
use marketfeed_core::data::{CircuitBreaker, YahooClient};
use marketfeed_core::{CandleSelector, ThreadSleeper};
use marketfeed_runner::news::{HttpSessionFactory, OpenAiTranslator};
use marketfeed_runner::{
    Backfill, CandleCycle, CollectorConfig, FundamentalsPipeline, NewsInput, NewsPipeline, NewsScan, RangeCollector,
    RunContext, RunError, RunFailure, RunReport, Ticker,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Loaded when `--config` is not given and the file exists.
const DEFAULT_CONFIG: &str = "marketfeed.toml";

/// Wait after an unexpected cycle failure in loop mode.
const LOOP_ERROR_WAIT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "marketfeed", about = "Marketfeed: fault-tolerant market data collector")]
struct Cli {
    /// Path to a TOML config file. Defaults to ./marketfeed.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect the newest complete minute bar for every ticker.
    Candles {
        /// Keep running, one cycle per minute, until Ctrl+C.
        #[arg(long = "loop", default_value_t = false)]
        repeat: bool,
    },
    /// Answer a range request file; the result lands in ../results/.
    History {
        /// Request JSON: {symbol, start_time, end_time}, {symbol, hours} or {symbol, mode}.
        request: PathBuf,
    },
    /// Search, crawl, translate and encode recent news for every stock ticker.
    News {
        /// Comma-separated symbols to search instead of the ticker list.
        #[arg(long, value_delimiter = ',', conflicts_with = "date")]
        symbols: Vec<String>,

        /// Articles per symbol (1-10).
        #[arg(long)]
        count: Option<usize>,

        /// Crawl the stubs of one date (YYYY-MM-DD) from the last scan instead of searching.
        #[arg(long)]
        date: Option<String>,
    },
    /// Search news for every stock and group the stubs by publication date.
    Scan,
    /// Collect statistics, statements, dividends and company profiles for every ticker.
    Fundamentals,
    /// Load the trailing window of minute bars for every ticker and write a summary.
    Backfill {
        /// Window per symbol; defaults to the configured 720 hours.
        #[arg(long)]
        hours: Option<u32>,
    },
}

/// What the news command should crawl.
#[derive(Debug)]
struct NewsArgs {
    symbols: Vec<String>,
    count: Option<usize>,
    date: Option<String>,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(cli.config.as_deref())?;
    let cancel = install_interrupt_handler();

    match cli.command {
        Commands::Candles { repeat: false } => run_candles_once(&config, &cancel),
        Commands::Candles { repeat: true } => run_candles_loop(&config, &cancel),
        Commands::History { request } => run_history(&config, &request),
        Commands::News { symbols, count, date } => run_news(&config, NewsArgs { symbols, count, date }, &cancel),
        Commands::Scan => run_scan(&config, &cancel),
        Commands::Fundamentals => run_fundamentals(&config, &cancel),
        Commands::Backfill { hours } => run_backfill(&config, hours, &cancel),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "marketfeed={level},marketfeed_core={level},marketfeed_runner={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CollectorConfig> {
    let default = Path::new(DEFAULT_CONFIG);
    let path = path.or_else(|| default.exists().then_some(default));
    let mut config = CollectorConfig::load(path)
        .with_context(|| format!("loading config {}", path.map_or("(defaults)".into(), |p| p.display().to_string())))?;
    config.apply_overrides(std::env::var("USER_AGENT").ok());
    Ok(config)
}

/// Ctrl+C sets the returned flag; a second Ctrl+C exits immediately.
fn install_interrupt_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl+C");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Ctrl+C received; stopping at the next item");
            flag.store(true, Ordering::SeqCst);
            if tokio::signal::ctrl_c().await.is_ok() {
                error!("second Ctrl+C; exiting");
                std::process::exit(130);
            }
        });
    });
    cancel
}

fn yahoo_client(config: &CollectorConfig) -> Result<YahooClient> {
    let breaker = Arc::new(CircuitBreaker::default_provider());
    Ok(YahooClient::new(config.provider.clone(), breaker, config.zone()?)?)
}

fn run_candles_once(config: &CollectorConfig, cancel: &AtomicBool) -> Result<()> {
    let client = yahoo_client(config)?;
    let cycle = CandleCycle::from_config(config, &client)?;
    let ctx = RunContext::production().with_cancel(cancel);
    finish(cycle.run(&ctx))
}

fn run_candles_loop(config: &CollectorConfig, cancel: &AtomicBool) -> Result<()> {
    let client = yahoo_client(config)?;
    let cycle = CandleCycle::from_config(config, &client)?;
    let ctx = RunContext::production().with_cancel(cancel);
    info!("candle loop started; Ctrl+C to stop");

    loop {
        if !sleep_unless_cancelled(until_next_minute(), cancel) {
            break;
        }
        match cycle.run(&ctx) {
            Ok(report) => print_summary(&report),
            Err(failure) => match failure.error {
                RunError::Interrupted => break,
                RunError::SnapshotRefused { .. } => {
                    warn!("no candles this cycle; keeping previous snapshot");
                }
                _ => {
                    error!(error = %failure, wait_secs = LOOP_ERROR_WAIT.as_secs(), "cycle failed; retrying after wait");
                    if !sleep_unless_cancelled(LOOP_ERROR_WAIT, cancel) {
                        break;
                    }
                }
            },
        }
    }

    info!("candle loop stopped");
    Ok(())
}

fn run_history(config: &CollectorConfig, request: &Path) -> Result<()> {
    let client = yahoo_client(config)?;
    let collector = RangeCollector {
        source: &client,
        selector: CandleSelector::new(config.bounds(), config.zone()?),
        retry: config.retry,
        sleeper: &ThreadSleeper,
    };

    let run = collector.run_request_file(request)?;
    println!("Result saved to: {}", run.written.path.display());
    if !run.result.is_success() {
        bail!(
            "request failed: {}",
            run.result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "{} {}: {}",
        run.result.symbol,
        run.result.mode.unwrap_or("range"),
        run.result.message.as_deref().unwrap_or("done")
    );
    Ok(())
}

/// Trimmed, uppercased and deduplicated, in the order given.
fn symbol_list(raw: &[String]) -> Vec<Ticker> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .map(Ticker::new)
        .collect()
}

fn news_input(config: &CollectorConfig, args: &NewsArgs) -> Result<NewsInput> {
    if let Some(date) = &args.date {
        return Ok(NewsInput::Scanned {
            path: config.paths.scan_snapshot(),
            date: date.clone(),
        });
    }
    if args.symbols.is_empty() {
        return Ok(NewsInput::TickerList);
    }
    let symbols = symbol_list(&args.symbols);
    if symbols.is_empty() {
        bail!("--symbols names no symbol");
    }
    Ok(NewsInput::Symbols(symbols))
}

fn run_news(config: &CollectorConfig, args: NewsArgs, cancel: &AtomicBool) -> Result<()> {
    let client = yahoo_client(config)?;
    let translator = OpenAiTranslator::from_env(config.news.translation.clone())?;
    let sessions = HttpSessionFactory::new(
        config.provider.user_agent.clone(),
        Duration::from_secs(config.provider.timeout_secs),
    );
    let mut pipeline =
        NewsPipeline::from_config(config, &client, &sessions, &translator)?.with_input(news_input(config, &args)?);
    if let Some(count) = args.count {
        pipeline = pipeline.with_per_symbol(count);
    }
    let ctx = RunContext::production().with_cancel(cancel);
    finish(pipeline.run(&ctx))
}

fn run_scan(config: &CollectorConfig, cancel: &AtomicBool) -> Result<()> {
    let client = yahoo_client(config)?;
    let scan = NewsScan::from_config(config, &client)?;
    let ctx = RunContext::production().with_cancel(cancel);
    finish(scan.run(&ctx))
}

fn run_fundamentals(config: &CollectorConfig, cancel: &AtomicBool) -> Result<()> {
    let client = yahoo_client(config)?;
    let pipeline = FundamentalsPipeline::from_config(config, &client)?;
    let ctx = RunContext::production().with_cancel(cancel);
    finish(pipeline.run(&ctx))
}

fn run_backfill(config: &CollectorConfig, hours: Option<u32>, cancel: &AtomicBool) -> Result<()> {
    if hours == Some(0) {
        bail!("--hours must be positive");
    }
    let client = yahoo_client(config)?;
    let collector = RangeCollector {
        source: &client,
        selector: CandleSelector::new(config.bounds(), config.zone()?),
        retry: config.retry,
        sleeper: &ThreadSleeper,
    };
    let mut backfill = Backfill::from_config(config, collector)?;
    if let Some(hours) = hours {
        backfill = backfill.with_hours(hours);
    }
    let ctx = RunContext::production().with_cancel(cancel);
    finish(backfill.run(&ctx))
}

fn finish(outcome: std::result::Result<RunReport, RunFailure>) -> Result<()> {
    match outcome {
        Ok(report) => {
            print_summary(&report);
            Ok(())
        }
        Err(failure) => {
            eprintln!(
                "{} run failed: {} succeeded, {} skipped, {} failed",
                failure.pipeline, failure.counts.succeeded, failure.counts.skipped, failure.counts.failed
            );
            Err(failure.into())
        }
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("=== {} ===", report.pipeline);
    println!("Requested:  {}", report.requested);
    println!("Succeeded:  {}", report.succeeded);
    println!("Skipped:    {}", report.skipped);
    println!("Failed:     {}", report.failed);
    println!("Elapsed:    {:.1}s", report.elapsed_ms as f64 / 1000.0);
    if let Some(path) = &report.snapshot {
        println!("Snapshot:   {}", path.display());
    }
    if let Some(hash) = &report.snapshot_hash {
        println!("BLAKE3:     {hash}");
    }
}

fn until_next_minute() -> Duration {
    let now = Utc::now();
    let into_minute = Duration::from_secs(u64::from(now.second())) + Duration::from_nanos(u64::from(now.nanosecond()));
    Duration::from_secs(60).saturating_sub(into_minute)
}

/// Sleep in short slices; false if the cancel flag was raised.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(200);
    let mut left = total;
    while !left.is_zero() {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let step = left.min(slice);
        std::thread::sleep(step);
        left -= step;
    }
    !cancel.load(Ordering::SeqCst)
}
