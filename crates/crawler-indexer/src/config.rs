use clap::{Args, Parser, Subcommand};
use crawler_common::{BlockRange, CrawlerError, Result};
use reqwest::Url;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crawler::CrawlSettings;
use crate::normalizer::AmountUnit;
use crate::retry::RetryPolicy;

/// Crawl Ethereum-style block ranges into SQLite.
#[derive(Debug, Parser)]
#[command(name = "block-crawler", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch every transaction in a block range and store it.
    Crawl(CrawlArgs),

    /// Report the block with the highest transfer volume in a time window.
    TopBlock(TopBlockArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CrawlArgs {
    /// JSON-RPC endpoint (http or https)
    #[arg(env = "RPC_URL")]
    pub rpc_endpoint: String,

    /// SQLite database file, created if missing
    #[arg(env = "DATABASE_PATH")]
    pub db_path: PathBuf,

    /// Inclusive block range, e.g. `18000000-18000100`
    pub block_range: String,

    /// Concurrent fetch workers
    #[arg(long, env = "FETCH_WORKERS", default_value_t = 8)]
    pub fetch_workers: u32,

    /// Upper bound on RPC requests per second across all workers
    #[arg(long, env = "RPC_REQUESTS_PER_SECOND", default_value_t = 25)]
    pub rpc_requests_per_second: u32,

    /// Attempts per RPC call before a block is given up
    #[arg(long, env = "RPC_MAX_ATTEMPTS", default_value_t = 5)]
    pub rpc_max_attempts: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub rpc_timeout_secs: u64,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 4)]
    pub db_max_connections: u32,

    /// Unit amounts are stored in
    #[arg(long, value_enum, env = "AMOUNT_UNIT", default_value_t = AmountUnit::Wei)]
    pub unit: AmountUnit,

    /// Abort once this many consecutive blocks fail on network errors
    #[arg(long, env = "MAX_CONSECUTIVE_FAILURES", default_value_t = 10)]
    pub max_consecutive_failures: u32,

    /// Refetch blocks already committed by an earlier run
    #[arg(long)]
    pub refetch: bool,
}

#[derive(Debug, Clone, Args)]
pub struct TopBlockArgs {
    /// SQLite database file written by `crawl`
    #[arg(env = "DATABASE_PATH")]
    pub db_path: PathBuf,

    /// Window start, Unix seconds (inclusive)
    #[arg(long)]
    pub from: u64,

    /// Window end, Unix seconds (inclusive)
    #[arg(long)]
    pub to: u64,
}

/// Validated crawl configuration
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub rpc_url: Url,
    pub db_path: PathBuf,
    pub db_max_connections: u32,
    pub range: BlockRange,
    pub fetch_workers: usize,
    pub rpc_requests_per_second: NonZeroU32,
    pub rpc_timeout: Duration,
    pub rpc_retry: RetryPolicy,
    pub storage_retry: RetryPolicy,
    pub unit: AmountUnit,
    pub max_consecutive_failures: u32,
    pub refetch: bool,
}

impl CrawlConfig {
    /// Validate arguments without touching the network or the database
    pub fn from_args(args: &CrawlArgs) -> Result<Self> {
        let rpc_url = parse_endpoint(&args.rpc_endpoint)?;
        validate_db_path(&args.db_path)?;
        let range: BlockRange = args.block_range.parse()?;

        if args.fetch_workers == 0 {
            return Err(CrawlerError::Config("--fetch-workers must be at least 1".to_string()));
        }
        let rpc_requests_per_second = NonZeroU32::new(args.rpc_requests_per_second)
            .ok_or_else(|| CrawlerError::Config("--rpc-requests-per-second must be at least 1".to_string()))?;
        if args.rpc_max_attempts == 0 {
            return Err(CrawlerError::Config("--rpc-max-attempts must be at least 1".to_string()));
        }
        if args.db_max_connections == 0 {
            return Err(CrawlerError::Config("--db-max-connections must be at least 1".to_string()));
        }

        Ok(Self {
            rpc_url,
            db_path: args.db_path.clone(),
            db_max_connections: args.db_max_connections,
            range,
            fetch_workers: args.fetch_workers as usize,
            rpc_requests_per_second,
            rpc_timeout: Duration::from_secs(args.rpc_timeout_secs.max(1)),
            rpc_retry: RetryPolicy { max_attempts: args.rpc_max_attempts, ..RetryPolicy::RPC },
            storage_retry: RetryPolicy::STORAGE,
            unit: args.unit,
            max_consecutive_failures: args.max_consecutive_failures.max(1),
            refetch: args.refetch,
        })
    }

    pub fn settings(&self) -> CrawlSettings {
        CrawlSettings {
            range: self.range,
            fetch_workers: self.fetch_workers,
            unit: self.unit,
            refetch: self.refetch,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| CrawlerError::Config(format!("invalid RPC endpoint '{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        "http" | "https" => Err(CrawlerError::Config(format!("RPC endpoint '{}' has no host", raw))),
        other => Err(CrawlerError::Config(format!(
            "unsupported RPC endpoint scheme '{}' (expected http or https)",
            other
        ))),
    }
}

/// The database file may not exist yet, but it must be creatable
pub(crate) fn validate_db_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(CrawlerError::Config("database path is empty".to_string()));
    }
    if path.is_dir() {
        return Err(CrawlerError::Config(format!("database path {} is a directory", path.display())));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(CrawlerError::Config(format!(
                "database directory {} does not exist",
                parent.display()
            )));
        }
    }
    Ok(())
}
