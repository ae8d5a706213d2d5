//! Raw RPC blocks to canonical `Transaction` rows.
//!
//! Everything here is pure: the same raw block and unit always produce the
//! same rows, with no I/O.

use alloy::primitives::{B256, U256};
use bigdecimal::BigDecimal;
use crawler_common::Transaction;
use num_bigint::{BigInt, Sign};
use std::str::FromStr;
use thiserror::Error;

use crate::fetcher::{parse_quantity, RawBlock, RawTransaction};

/// Unit in which amounts are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AmountUnit {
    /// Chain base unit, stored unchanged
    #[default]
    Wei,
    Gwei,
    Ether,
}

impl AmountUnit {
    /// Decimal places between wei and this unit
    pub const fn decimals(self) -> i64 {
        match self {
            AmountUnit::Wei => 0,
            AmountUnit::Gwei => 9,
            AmountUnit::Ether => 18,
        }
    }

    /// Exact conversion of a wei value. The result is the 256-bit integer with
    /// the decimal point shifted, so no digit is ever rounded away.
    pub fn convert(self, wei: U256) -> BigDecimal {
        let digits = BigInt::from_bytes_be(Sign::Plus, &wei.to_be_bytes::<32>());
        BigDecimal::new(digits, self.decimals())
    }
}

/// Why a block as a whole could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("block has no timestamp")]
    MissingTimestamp,

    #[error("invalid block timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("requested block {expected} but node returned {found}")]
    NumberMismatch { expected: u64, found: String },

    #[error("block has no transaction list")]
    MissingTransactions,
}

/// Why a single transaction was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("missing hash")]
    MissingHash,

    #[error("invalid hash '{0}'")]
    InvalidHash(String),

    #[error("invalid value '{0}'")]
    InvalidValue(String),

    #[error("transaction claims block {0}")]
    WrongBlock(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTransaction {
    /// Position in the block's transaction list
    pub index: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBlock {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub skipped: Vec<SkippedTransaction>,
}

impl NormalizedBlock {
    /// The block had transactions but none of them could be used
    pub fn is_unusable(&self) -> bool {
        self.transactions.is_empty() && !self.skipped.is_empty()
    }
}

pub fn normalize(expected: u64, raw: &RawBlock, unit: AmountUnit) -> Result<NormalizedBlock, NormalizeError> {
    if let Some(number) = raw.number.as_deref() {
        if parse_quantity(number) != Some(expected) {
            return Err(NormalizeError::NumberMismatch {
                expected,
                found: number.to_string(),
            });
        }
    }

    let timestamp = raw.timestamp.as_deref().ok_or(NormalizeError::MissingTimestamp)?;
    let timestamp = parse_quantity(timestamp).ok_or_else(|| NormalizeError::InvalidTimestamp(timestamp.to_string()))?;

    let raw_txs = raw.transactions.as_ref().ok_or(NormalizeError::MissingTransactions)?;

    let mut transactions = Vec::with_capacity(raw_txs.len());
    let mut skipped = Vec::new();

    for (index, raw_tx) in raw_txs.iter().enumerate() {
        match normalize_transaction(raw_tx, expected, timestamp, unit) {
            Ok(tx) => transactions.push(tx),
            Err(reason) => skipped.push(SkippedTransaction { index, reason }),
        }
    }

    Ok(NormalizedBlock {
        number: expected,
        timestamp,
        transactions,
        skipped,
    })
}

fn normalize_transaction(
    raw: &RawTransaction,
    block_no: u64,
    ts: u64,
    unit: AmountUnit,
) -> Result<Transaction, SkipReason> {
    let hash = raw.hash.as_deref().ok_or(SkipReason::MissingHash)?;
    let hash = B256::from_str(hash).map_err(|_| SkipReason::InvalidHash(hash.to_string()))?;

    if let Some(claimed) = raw.block_number.as_deref() {
        if parse_quantity(claimed) != Some(block_no) {
            return Err(SkipReason::WrongBlock(claimed.to_string()));
        }
    }

    // Zero-value transfers are ordinary chain events; a missing value means zero
    let wei = match raw.value.as_deref() {
        None => U256::ZERO,
        Some(value) => U256::from_str(value).map_err(|_| SkipReason::InvalidValue(value.to_string()))?,
    };

    Ok(Transaction {
        hash: format!("{:?}", hash),
        block_no,
        amount: unit.convert(wei),
        ts,
    })
}
