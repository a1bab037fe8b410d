//! Snapshot+diff book synchroniser with gap detection.
//!
//! Enforces the sequence rule `U <= last_update_id + 1 <= u` on every diff
//! and drives the `Init -> Synced -> Resync -> Synced` lifecycle. Downstream
//! trade aggregators are deliberately untouched on a gap: a book gap does
//! not invalidate trade-derived state.

use tracing::{debug, warn};

use super::state::OrderBook;

/// A parsed depth snapshot (`lastUpdateId` plus full level lists).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_update_id: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// A parsed diff-depth event. `first_update_id`/`last_update_id` are the
/// inclusive `[U, u]` bounds of the batch.
#[derive(Debug, Clone)]
pub struct Diff {
    pub first_update_id: i64,
    pub last_update_id: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub event_time_ms: i64,
}

/// Synchroniser lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot applied yet.
    Init,
    /// Book is gap-free and publishable.
    Synced,
    /// A gap was detected; levels are stale until the next snapshot.
    Resync,
}

/// Outcome of one diff application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// All pairs applied, `last_update_id` advanced to `u`.
    Applied,
    /// Entire batch already covered; state unchanged.
    Dropped,
    /// `U > last_update_id + 1`: a diff was missed. State unchanged, a
    /// fresh snapshot is required.
    Gap,
}

#[derive(Debug)]
pub struct BookSynchroniser {
    symbol: String,
    book: OrderBook,
    state: SyncState,
}

impl BookSynchroniser {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            book: OrderBook::new(),
            state: SyncState::Init,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Replace the book from a snapshot and leave `Init`/`Resync`.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.book
            .replace(&snapshot.bids, &snapshot.asks, snapshot.last_update_id);
        if self.state != SyncState::Synced {
            debug!(
                symbol = %self.symbol,
                last_update_id = snapshot.last_update_id,
                "book synced from snapshot"
            );
        }
        self.state = SyncState::Synced;
    }

    /// Apply one diff under the sequence rule.
    pub fn apply_diff(&mut self, diff: &Diff) -> DiffOutcome {
        let last = self.book.last_update_id();

        if diff.last_update_id <= last {
            return DiffOutcome::Dropped;
        }
        if diff.first_update_id > last + 1 {
            warn!(
                symbol = %self.symbol,
                expected = last + 1,
                got_first = diff.first_update_id,
                got_last = diff.last_update_id,
                "depth gap detected, requesting snapshot"
            );
            self.state = SyncState::Resync;
            return DiffOutcome::Gap;
        }

        for &(p, q) in &diff.bids {
            self.book.apply_bid(p, q);
        }
        for &(p, q) in &diff.asks {
            self.book.apply_ask(p, q);
        }
        self.book.set_last_update_id(diff.last_update_id);
        DiffOutcome::Applied
    }
}
