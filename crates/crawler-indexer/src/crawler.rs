use crawler_common::{BlockRange, CrawlerError, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{RawBlock, RpcClient};
use crate::normalizer::{self, AmountUnit, NormalizedBlock};
use crate::summary::{BlockOutcome, RunSummary};
use crate::writer::StorageWriter;

/// Progress is logged every N finished blocks
const PROGRESS_INTERVAL: u64 = 100;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub range: BlockRange,
    /// Concurrent fetch+normalize workers
    pub fetch_workers: usize,
    pub unit: AmountUnit,
    /// Refetch blocks that an earlier run already committed
    pub refetch: bool,
    /// Consecutive network-failed blocks after which the endpoint is considered down
    pub max_consecutive_failures: u32,
}

/// What a fetch worker hands to the writer stage
#[derive(Debug)]
enum WorkerReport {
    Normalized(NormalizedBlock),
    Malformed { block: u64, reason: String, dropped: usize },
    Failed { block: u64, error: CrawlerError },
    Interrupted { block: u64 },
}

pub struct Crawler {
    client: RpcClient,
    writer: StorageWriter,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(client: RpcClient, writer: StorageWriter, settings: CrawlSettings) -> Self {
        Self { client, writer, settings }
    }

    /// Walk the configured range once.
    ///
    /// Never fails as a whole: infrastructure failures end the run early with
    /// an aborted status, and the returned summary still accounts for every
    /// block. Cancelling `cancel` stops new fetches and drains what is
    /// already fetched.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let range = self.settings.range;
        let mut summary = RunSummary::new(range);

        // Child token: aborting the run stops our workers without touching the caller's token
        let token = cancel.child_token();

        match self.client.block_number().await {
            Ok(head) => {
                tracing::info!("Connected to {} (chain head {})", self.client.url(), head);
                if range.end() > head {
                    tracing::warn!(
                        "Range end {} is beyond chain head {}; blocks past the head will fail after retries",
                        range.end(),
                        head
                    );
                }
            }
            Err(e) => {
                tracing::error!("RPC endpoint unreachable: {}", e);
                summary.abort(format!("RPC endpoint unreachable: {}", e));
                summary.set_elapsed(started.elapsed());
                return summary;
            }
        }

        let committed = match self.previously_committed(&mut summary).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!("Failed to read crawl progress: {}", e);
                summary.abort(format!("storage unavailable: {}", e));
                summary.set_elapsed(started.elapsed());
                return summary;
            }
        };

        let num_workers = self.settings.fetch_workers.max(1);
        tracing::info!(
            "Crawling {} blocks in {} ({} already committed) with {} fetch workers",
            range.len().saturating_sub(committed.len() as u64),
            range,
            committed.len(),
            num_workers
        );

        let (work_tx, work_rx) = async_channel::bounded::<u64>(num_workers * 2);
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(num_workers * 2);

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers + 1);
        for worker_id in 0..num_workers {
            handles.push(tokio::spawn(fetch_worker(
                worker_id,
                self.client.clone(),
                self.settings.unit,
                work_rx.clone(),
                report_tx.clone(),
                token.clone(),
            )));
        }
        // Only workers hold senders now, so the report channel closes when they are all done
        drop(report_tx);
        drop(work_rx);

        let dispatch_token = token.clone();
        // Lazy walk: a range may be far wider than what fits in memory
        handles.push(tokio::spawn(async move {
            for block in range.iter().filter(|b| !committed.contains(b)) {
                tokio::select! {
                    biased;
                    () = dispatch_token.cancelled() => break,
                    sent = work_tx.send(block) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        // Single writer stage: commits are serialized here
        let mut consecutive_failures = 0u32;
        let mut finished = 0u64;
        while let Some(report) = report_rx.recv().await {
            match report {
                WorkerReport::Normalized(block) => match self.writer.persist(&block).await {
                    Ok(written) => {
                        consecutive_failures = 0;
                        tracing::debug!("Block {}: committed ({} new rows)", block.number, written);
                        summary.record(block.number, BlockOutcome::Committed {
                            written,
                            skipped: block.skipped.len(),
                        });
                    }
                    Err(e) => {
                        tracing::error!("Block {}: commit failed, aborting run: {}", block.number, e);
                        summary.record(block.number, BlockOutcome::Failed { reason: e.to_string() });
                        summary.abort(format!("storage failure at block {}: {}", block.number, e));
                        token.cancel();
                        break;
                    }
                },
                WorkerReport::Malformed { block, reason, dropped } => {
                    consecutive_failures = 0;
                    tracing::warn!("Block {}: skipped as malformed: {}", block, reason);
                    summary.add_skipped_transactions(dropped);
                    summary.record(block, BlockOutcome::SkippedMalformed { reason });
                }
                WorkerReport::Failed { block, error } => {
                    tracing::error!("Block {}: fetch failed: {}", block, error);
                    if matches!(error, CrawlerError::Network(_)) {
                        consecutive_failures += 1;
                    }
                    summary.record(block, BlockOutcome::Failed { reason: error.to_string() });

                    if consecutive_failures >= self.settings.max_consecutive_failures.max(1) {
                        tracing::error!("{} consecutive blocks failed on network errors, aborting run", consecutive_failures);
                        summary.abort(format!(
                            "RPC endpoint unreachable: {} consecutive blocks failed",
                            consecutive_failures
                        ));
                        token.cancel();
                        break;
                    }
                }
                WorkerReport::Interrupted { block } => {
                    tracing::debug!("Block {}: fetch interrupted", block);
                    summary.record(block, BlockOutcome::Interrupted);
                }
            }

            finished += 1;
            if finished % PROGRESS_INTERVAL == 0 {
                tracing::info!(
                    "Progress: {} blocks processed, {} committed, {} transactions written ({:.1}s)",
                    finished,
                    summary.blocks_committed(),
                    summary.transactions_written(),
                    started.elapsed().as_secs_f64()
                );
            }
        }

        // Workers blocked on a full report channel see it closed and exit
        drop(report_rx);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Crawler task panicked: {}", e);
            }
        }

        if cancel.is_cancelled() {
            summary.mark_cancelled();
        }
        summary.set_elapsed(started.elapsed());

        tracing::info!(
            "Crawl {}: {} committed, {} skipped, {} failed, {} transactions written",
            summary.status(),
            summary.blocks_committed(),
            summary.skipped_blocks().len(),
            summary.failed_blocks().len(),
            summary.transactions_written()
        );
        summary
    }

    /// Blocks of the range committed by an earlier run, recorded as such.
    /// Empty when a refetch was requested.
    async fn previously_committed(&self, summary: &mut RunSummary) -> Result<BTreeSet<u64>> {
        if self.settings.refetch {
            return Ok(BTreeSet::new());
        }

        let committed = self.writer.committed_blocks(self.settings.range).await?;
        for block in &committed {
            summary.record(*block, BlockOutcome::AlreadyCommitted);
        }
        Ok(committed)
    }
}

/// Cancel `token` on the first interrupt and keep listening. Returns `true`
/// once a second interrupt arrives, `false` if the signal source fails.
pub async fn watch_interrupts<F, Fut>(mut next_interrupt: F, token: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut received = 0u32;
    loop {
        if let Err(e) = next_interrupt().await {
            tracing::error!("Failed to listen for interrupts: {}", e);
            return false;
        }
        received += 1;
        if received > 1 {
            return true;
        }
        tracing::warn!("Interrupt received, finishing blocks already fetched (interrupt again to exit now)");
        token.cancel();
    }
}

async fn fetch_worker(
    worker_id: usize,
    client: RpcClient,
    unit: AmountUnit,
    work_rx: async_channel::Receiver<u64>,
    report_tx: mpsc::Sender<WorkerReport>,
    token: CancellationToken,
) {
    tracing::debug!("Worker {} started", worker_id);
    loop {
        let block = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = work_rx.recv() => match next {
                Ok(block) => block,
                Err(_) => break,
            },
        };

        let report = tokio::select! {
            biased;
            () = token.cancelled() => WorkerReport::Interrupted { block },
            fetched = client.fetch_block(block) => classify(block, fetched, unit),
        };

        let interrupted = matches!(report, WorkerReport::Interrupted { .. });
        if report_tx.send(report).await.is_err() || interrupted {
            break;
        }
    }
    tracing::debug!("Worker {} shutting down", worker_id);
}

/// Turn a fetch result into a report: fetch failures stay per-block,
/// malformed payloads and blocks without a single usable transaction are skipped
fn classify(block: u64, fetched: Result<RawBlock>, unit: AmountUnit) -> WorkerReport {
    let raw = match fetched {
        Ok(raw) => raw,
        Err(CrawlerError::MalformedResponse(reason)) => {
            return WorkerReport::Malformed { block, reason, dropped: 0 };
        }
        Err(error) => return WorkerReport::Failed { block, error },
    };

    match normalizer::normalize(block, &raw, unit) {
        Ok(normalized) if normalized.is_unusable() => {
            let reasons: Vec<String> = normalized
                .skipped
                .iter()
                .map(|s| format!("tx {}: {}", s.index, s.reason))
                .collect();
            WorkerReport::Malformed {
                block,
                reason: format!("no usable transactions ({})", reasons.join("; ")),
                dropped: normalized.skipped.len(),
            }
        }
        Ok(normalized) => {
            for skipped in &normalized.skipped {
                tracing::warn!("Block {}: dropping transaction {}: {}", block, skipped.index, skipped.reason);
            }
            WorkerReport::Normalized(normalized)
        }
        Err(e) => WorkerReport::Malformed {
            block,
            reason: e.to_string(),
            dropped: 0,
        },
    }
}
