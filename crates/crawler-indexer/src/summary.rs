use crawler_common::BlockRange;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Terminal state of one block in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Rows committed; `written` counts rows that were not already stored
    Committed { written: u64, skipped: usize },
    /// Marked as crawled by an earlier run and not refetched
    AlreadyCommitted,
    /// Malformed payload or no usable transactions; refetching will not help
    SkippedMalformed { reason: String },
    /// Fetch exhausted its retries, or the commit failed
    Failed { reason: String },
    /// Fetch aborted by cancellation
    Interrupted,
}

impl BlockOutcome {
    /// Whether the block needs no further work in a later run
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            BlockOutcome::Committed { .. } | BlockOutcome::AlreadyCommitted | BlockOutcome::SkippedMalformed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Aborted { reason: String },
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// Accounting for a crawl run. Every block of the range ends up either with
/// exactly one recorded outcome or counted as not started.
#[derive(Debug, Clone)]
pub struct RunSummary {
    range: BlockRange,
    status: RunStatus,
    outcomes: BTreeMap<u64, BlockOutcome>,
    transactions_written: u64,
    transactions_skipped: u64,
    elapsed: Duration,
}

impl RunSummary {
    pub fn new(range: BlockRange) -> Self {
        Self {
            range,
            status: RunStatus::Completed,
            outcomes: BTreeMap::new(),
            transactions_written: 0,
            transactions_skipped: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Record the terminal outcome of a block. A second outcome for the same
    /// block is ignored so that no block is ever counted twice.
    pub fn record(&mut self, block: u64, outcome: BlockOutcome) {
        if !self.range.contains(block) {
            tracing::warn!("Ignoring outcome for block {} outside range {}", block, self.range);
            return;
        }
        if let Some(existing) = self.outcomes.get(&block) {
            tracing::warn!("Block {} already recorded as {:?}, ignoring {:?}", block, existing, outcome);
            return;
        }
        if let BlockOutcome::Committed { written, skipped } = &outcome {
            self.transactions_written += written;
            self.transactions_skipped += *skipped as u64;
        }
        self.outcomes.insert(block, outcome);
    }

    /// Add dropped transactions of a block that did not commit
    pub fn add_skipped_transactions(&mut self, count: usize) {
        self.transactions_skipped += count as u64;
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        // The first abort reason is the root cause; later ones are consequences
        if !matches!(self.status, RunStatus::Aborted { .. }) {
            self.status = RunStatus::Aborted { reason: reason.into() };
        }
    }

    pub fn mark_cancelled(&mut self) {
        if self.status == RunStatus::Completed {
            self.status = RunStatus::Cancelled;
        }
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn outcome(&self, block: u64) -> Option<&BlockOutcome> {
        self.outcomes.get(&block)
    }

    fn count(&self, pred: impl Fn(&BlockOutcome) -> bool) -> u64 {
        self.outcomes.values().filter(|o| pred(o)).count() as u64
    }

    pub fn blocks_requested(&self) -> u64 {
        self.range.len()
    }

    /// Blocks this run actually tried to fetch
    pub fn blocks_attempted(&self) -> u64 {
        self.count(|o| !matches!(o, BlockOutcome::AlreadyCommitted))
    }

    pub fn blocks_committed(&self) -> u64 {
        self.count(|o| matches!(o, BlockOutcome::Committed { .. }))
    }

    pub fn blocks_already_committed(&self) -> u64 {
        self.count(|o| matches!(o, BlockOutcome::AlreadyCommitted))
    }

    pub fn blocks_interrupted(&self) -> u64 {
        self.count(|o| matches!(o, BlockOutcome::Interrupted))
    }

    pub fn blocks_not_started(&self) -> u64 {
        self.range.len() - self.outcomes.len() as u64
    }

    pub fn skipped_blocks(&self) -> Vec<(u64, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(block, o)| match o {
                BlockOutcome::SkippedMalformed { reason } => Some((*block, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failed_blocks(&self) -> Vec<(u64, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(block, o)| match o {
                BlockOutcome::Failed { reason } => Some((*block, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    fn blocks_resolved(&self) -> u64 {
        self.count(BlockOutcome::is_resolved)
    }

    /// Number of blocks a follow-up run still has to process: failed,
    /// interrupted or never started
    pub fn unfinished_count(&self) -> u64 {
        self.range.len().saturating_sub(self.blocks_resolved())
    }

    /// Unfinished blocks as maximal contiguous ranges. Built from the
    /// recorded outcomes, so its size does not depend on the range width.
    pub fn unfinished_ranges(&self) -> Vec<BlockRange> {
        let mut ranges = Vec::new();
        // `None` once the cursor has moved past `u64::MAX`
        let mut cursor = Some(self.range.start());

        for (&block, outcome) in &self.outcomes {
            if !outcome.is_resolved() {
                continue;
            }
            if let Some(next) = cursor.filter(|next| *next < block) {
                ranges.extend(BlockRange::new(next, block - 1).ok());
            }
            cursor = block.checked_add(1);
        }
        if let Some(next) = cursor.filter(|next| *next <= self.range.end()) {
            ranges.extend(BlockRange::new(next, self.range.end()).ok());
        }
        ranges
    }

    pub fn transactions_written(&self) -> u64 {
        self.transactions_written
    }

    pub fn transactions_skipped(&self) -> u64 {
        self.transactions_skipped
    }

    /// Highest block `b` such that every block in `[start, b]` carries a
    /// commit marker. Skipped blocks stop the walk: they have no marker and
    /// a later run fetches them again.
    pub fn last_committed_block(&self) -> Option<u64> {
        let mut last = None;
        for (&block, outcome) in self.outcomes.range(self.range.start()..) {
            let expected = last.map_or(Some(self.range.start()), |b: u64| b.checked_add(1));
            let has_marker = matches!(outcome, BlockOutcome::Committed { .. } | BlockOutcome::AlreadyCommitted);
            if Some(block) != expected || !has_marker {
                break;
            }
            last = Some(block);
        }
        last
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.blocks_resolved() == self.range.len()
    }
}

/// Render ranges compactly, e.g. `3-5, 9`
pub fn format_ranges(ranges: &[BlockRange]) -> String {
    ranges
        .iter()
        .map(|r| if r.len() == 1 { r.start().to_string() } else { r.to_string() })
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Crawl summary for blocks {} ({:.1}s)", self.range, self.elapsed.as_secs_f64())?;
        writeln!(f, "  status:               {}", self.status)?;
        writeln!(f, "  blocks requested:     {}", self.blocks_requested())?;
        writeln!(f, "  blocks attempted:     {}", self.blocks_attempted())?;
        writeln!(f, "  blocks committed:     {}", self.blocks_committed())?;
        writeln!(f, "  already committed:    {}", self.blocks_already_committed())?;
        writeln!(f, "  blocks skipped:       {}", self.skipped_blocks().len())?;
        writeln!(f, "  blocks failed:        {}", self.failed_blocks().len())?;
        writeln!(f, "  blocks interrupted:   {}", self.blocks_interrupted())?;
        writeln!(f, "  blocks not started:   {}", self.blocks_not_started())?;
        writeln!(f, "  transactions written: {}", self.transactions_written)?;
        writeln!(f, "  transactions skipped: {}", self.transactions_skipped)?;
        match self.last_committed_block() {
            Some(block) => writeln!(f, "  last committed block: {}", block)?,
            None => writeln!(f, "  last committed block: none")?,
        }
        for (block, reason) in self.skipped_blocks() {
            writeln!(f, "  skipped {}: {}", block, reason)?;
        }
        for (block, reason) in self.failed_blocks() {
            writeln!(f, "  failed {}: {}", block, reason)?;
        }
        let unfinished = self.unfinished_ranges();
        if !unfinished.is_empty() {
            writeln!(f, "  re-run needed for:    {}", format_ranges(&unfinished))?;
        }
        Ok(())
    }
}
