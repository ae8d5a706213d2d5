use anyhow::{bail, Context, Result};
use clap::Parser;
use crawler_common::{db, query};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawler_indexer::config::{Cli, Command, CrawlArgs, CrawlConfig, TopBlockArgs};
use crawler_indexer::crawler::watch_interrupts;
use crawler_indexer::{Crawler, RpcClient, RunStatus, StorageWriter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "block_crawler=info,crawler_indexer=info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // .env has to be loaded before clap reads its env fallbacks
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Crawl(args) => cmd_crawl(args).await,
        Command::TopBlock(args) => cmd_top_block(args).await,
    }
}

async fn cmd_crawl(args: CrawlArgs) -> Result<()> {
    let config = CrawlConfig::from_args(&args).context("invalid crawl arguments")?;

    tracing::info!(
        "Starting block crawler: blocks {} from {} into {}",
        config.range,
        config.rpc_url,
        config.db_path.display()
    );

    let pool = db::create_pool(&config.db_path, config.db_max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let writer = StorageWriter::new(pool, config.storage_retry);
    writer.ensure_schema().await.context("failed to prepare database schema")?;

    let client = RpcClient::new(
        config.rpc_url.clone(),
        config.rpc_requests_per_second,
        config.rpc_timeout,
        config.rpc_retry,
    )?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, ctrl_c_token).await {
            tracing::error!("Second interrupt received, exiting without draining the writer");
            std::process::exit(130);
        }
    });

    let crawler = Crawler::new(client, writer.clone(), config.settings());
    let summary = crawler.run(cancel).await;
    print_summary(&summary);

    writer.close().await;

    match summary.status() {
        RunStatus::Aborted { reason } => bail!("crawl aborted: {}", reason),
        RunStatus::Cancelled => bail!("crawl cancelled before the range was finished"),
        RunStatus::Completed if !summary.is_success() => {
            bail!("{} blocks need a re-run", summary.unfinished_count())
        }
        RunStatus::Completed => Ok(()),
    }
}

async fn cmd_top_block(args: TopBlockArgs) -> Result<()> {
    if args.from > args.to {
        bail!("--from ({}) must not be after --to ({})", args.from, args.to);
    }
    if !args.db_path.is_file() {
        bail!("database {} does not exist", args.db_path.display());
    }

    let pool = db::create_pool(&args.db_path, 1)
        .await
        .with_context(|| format!("failed to open database {}", args.db_path.display()))?;

    let top = query::top_block_by_volume(&pool, args.from, args.to).await?;
    print_top_block(&args, top.as_ref());

    pool.close().await;
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_summary(summary: &crawler_indexer::RunSummary) {
    print!("{}", summary);
}

#[allow(clippy::print_stdout)]
fn print_top_block(args: &TopBlockArgs, top: Option<&crawler_common::BlockVolume>) {
    println!(
        "Window: {} .. {}",
        format_ts(args.from),
        format_ts(args.to)
    );
    match top {
        Some(top) => {
            println!("Block:  {}", top.block_no);
            println!("Volume: {}", top.total_volume.to_plain_string());
        }
        None => println!("No transactions in this window"),
    }
}

fn format_ts(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| format!("{} ({})", ts, dt.format("%Y-%m-%d %H:%M:%S UTC")))
        .unwrap_or_else(|| ts.to_string())
}
