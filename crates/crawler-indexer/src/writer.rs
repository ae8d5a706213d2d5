use crawler_common::{db, BlockRange, Result};
use sqlx::SqlitePool;
use std::collections::BTreeSet;

use crate::normalizer::NormalizedBlock;
use crate::retry::{with_retry, RetryPolicy};

/// Owns the database pool and commits one block per transaction.
///
/// Only the crawler's writer stage calls [`StorageWriter::persist`], so
/// commits are serialized even though the pool may hold several connections
/// for readers.
#[derive(Clone)]
pub struct StorageWriter {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl StorageWriter {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indices if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        tracing::info!("Running database migrations");
        db::run_migrations(&self.pool).await?;
        Ok(())
    }

    /// Commit all transactions of a block together with its crawl marker.
    ///
    /// Rows whose hash is already stored are left untouched. Returns the
    /// number of newly inserted rows.
    pub async fn persist(&self, block: &NormalizedBlock) -> Result<u64> {
        let what = format!("Persisting block {}", block.number);
        with_retry(&self.retry, &what, move || self.persist_once(block)).await
    }

    async fn persist_once(&self, block: &NormalizedBlock) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for transaction in &block.transactions {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO Transactions (hash, block_no, amount, ts) VALUES (?1, ?2, ?3, ?4)"
            )
            .bind(&transaction.hash)
            .bind(transaction.block_no as i64)
            .bind(transaction.amount.to_plain_string())
            .bind(transaction.ts as i64)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        sqlx::query(
            "INSERT INTO crawled_blocks (block_no, tx_count, ts, crawled_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (block_no) DO UPDATE SET
                tx_count = excluded.tx_count,
                ts = excluded.ts,
                crawled_at = excluded.crawled_at"
        )
        .bind(block.number as i64)
        .bind(block.transactions.len() as i64)
        .bind(block.timestamp as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Block {}: {} transactions persisted ({} new)",
            block.number,
            block.transactions.len(),
            inserted
        );
        Ok(inserted)
    }

    /// Blocks in `range` that were fully committed by an earlier run
    pub async fn committed_blocks(&self, range: BlockRange) -> Result<BTreeSet<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT block_no FROM crawled_blocks WHERE block_no BETWEEN ?1 AND ?2"
        )
        // SQLite integers are signed; no stored block lies above i64::MAX
        .bind(i64::try_from(range.start()).unwrap_or(i64::MAX))
        .bind(i64::try_from(range.end()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(block_no,)| block_no as u64).collect())
    }

    /// Close the pool, waiting for in-flight statements to finish
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
