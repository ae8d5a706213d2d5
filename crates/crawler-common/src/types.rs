use bigdecimal::BigDecimal;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::CrawlerError;

/// Transaction row as stored in the `Transactions` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// `0x`-prefixed lowercase hex digest
    pub hash: String,
    pub block_no: u64,
    /// Exact amount in the canonical unit chosen for the run
    pub amount: BigDecimal,
    /// Block timestamp (Unix seconds)
    pub ts: u64,
}

/// Summed transfer volume of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVolume {
    pub block_no: u64,
    pub total_volume: BigDecimal,
}

/// Closed interval `[start, end]` of block numbers.
///
/// Construction validates `start <= end`, so a `BlockRange` that exists is
/// always walkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Result<Self, CrawlerError> {
        if start > end {
            return Err(CrawlerError::Config(format!(
                "block range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of blocks in the range
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, block: u64) -> bool {
        (self.start..=self.end).contains(&block)
    }

    pub fn iter(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl FromStr for BlockRange {
    type Err = CrawlerError;

    /// Parse the `start-end` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            CrawlerError::Config(format!(
                "invalid block range '{}': expected <start>-<end> with non-negative integers",
                s
            ))
        };

        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;

        Self::new(start, end)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
