//! Read-only reporting queries over the `Transactions` table.

use bigdecimal::BigDecimal;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Result;
use crate::types::{BlockVolume, Transaction};

fn parse_amount(raw: &str) -> Result<BigDecimal> {
    BigDecimal::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)).into())
}

/// Block with the largest summed `amount` among transactions whose `ts` lies
/// in `[from_ts, to_ts]`.
///
/// Amounts are stored as exact decimal text, so the sum is computed here with
/// arbitrary precision rather than with SQLite's floating-point `SUM`. When
/// several blocks share the maximum, the lowest block number wins.
pub async fn top_block_by_volume(
    pool: &SqlitePool,
    from_ts: u64,
    to_ts: u64,
) -> Result<Option<BlockVolume>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT block_no, amount FROM Transactions WHERE ts BETWEEN ?1 AND ?2"
    )
    .bind(from_ts as i64)
    .bind(to_ts as i64)
    .fetch_all(pool)
    .await?;

    let mut volumes: BTreeMap<i64, BigDecimal> = BTreeMap::new();
    for (block_no, amount) in rows {
        *volumes.entry(block_no).or_insert_with(|| BigDecimal::from(0)) += parse_amount(&amount)?;
    }

    let mut best: Option<(i64, BigDecimal)> = None;
    for (block_no, total) in volumes {
        // BTreeMap iterates ascending, so a strict comparison keeps the lowest block on ties
        if best.as_ref().map_or(true, |(_, max)| total > *max) {
            best = Some((block_no, total));
        }
    }

    Ok(best.map(|(block_no, total_volume)| BlockVolume {
        block_no: block_no as u64,
        total_volume,
    }))
}

pub async fn count_transactions(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM Transactions")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}

/// All stored transactions of one block, ordered by hash
pub async fn block_transactions(pool: &SqlitePool, block_no: u64) -> Result<Vec<Transaction>> {
    let rows: Vec<(String, i64, String, i64)> = sqlx::query_as(
        "SELECT hash, block_no, amount, ts FROM Transactions WHERE block_no = ?1 ORDER BY hash"
    )
    .bind(block_no as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(hash, block_no, amount, ts)| {
            Ok(Transaction {
                hash,
                block_no: block_no as u64,
                amount: parse_amount(&amount)?,
                ts: ts as u64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const T0: u64 = 1_700_000_000;

    async fn seeded_pool(dir: &tempfile::TempDir, rows: &[(&str, u64, &str, u64)]) -> SqlitePool {
        let pool = db::create_pool(&dir.path().join("query.db"), 1).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        for (hash, block_no, amount, ts) in rows {
            sqlx::query("INSERT INTO Transactions (hash, block_no, amount, ts) VALUES (?1, ?2, ?3, ?4)")
                .bind(*hash)
                .bind(*block_no as i64)
                .bind(*amount)
                .bind(*ts as i64)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_top_block_picks_highest_sum() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(&dir, &[
            ("A", 10, "5", T0),
            ("B", 10, "3", T0 + 60),
            ("C", 11, "100", T0 + 60),
        ]).await;

        let top = top_block_by_volume(&pool, T0, T0 + 1800).await.unwrap().unwrap();
        assert_eq!(top.block_no, 11);
        assert_eq!(top.total_volume, BigDecimal::from(100));
    }

    #[tokio::test]
    async fn test_top_block_respects_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(&dir, &[
            ("A", 10, "5", T0),
            ("B", 10, "3", T0 + 60),
            ("C", 11, "100", T0 + 3600),
        ]).await;

        let top = top_block_by_volume(&pool, T0, T0 + 1800).await.unwrap().unwrap();
        assert_eq!(top.block_no, 10);
        assert_eq!(top.total_volume, BigDecimal::from(8));

        assert!(top_block_by_volume(&pool, T0 + 7200, T0 + 9000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_top_block_tie_prefers_lowest_block() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(&dir, &[
            ("A", 12, "50", T0),
            ("B", 9, "20", T0),
            ("C", 9, "30", T0),
        ]).await;

        let top = top_block_by_volume(&pool, T0, T0).await.unwrap().unwrap();
        assert_eq!(top.block_no, 9);
    }

    #[tokio::test]
    async fn test_top_block_sums_exactly_beyond_i64() {
        let dir = tempfile::tempdir().unwrap();
        // 100 ETH and 0.5 ETH in wei: far beyond what a 64-bit integer or an f64 holds exactly
        let pool = seeded_pool(&dir, &[
            ("A", 1, "100000000000000000000", T0),
            ("B", 1, "500000000000000001", T0),
        ]).await;

        let top = top_block_by_volume(&pool, T0, T0).await.unwrap().unwrap();
        assert_eq!(top.total_volume, BigDecimal::from_str("100500000000000000001").unwrap());
    }

    #[tokio::test]
    async fn test_block_transactions_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let pool = seeded_pool(&dir, &[
            ("0xbb", 4, "0.25", T0),
            ("0xaa", 4, "0", T0),
            ("0xcc", 5, "1", T0 + 12),
        ]).await;

        assert_eq!(count_transactions(&pool).await.unwrap(), 3);

        let txs = block_transactions(&pool, 4).await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].hash, "0xaa");
        assert_eq!(txs[1].amount, BigDecimal::from_str("0.25").unwrap());
        assert_eq!(txs[1].ts, T0);
    }
}
