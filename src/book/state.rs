//! L2 order book storage keyed by price.

use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

type Price = OrderedFloat<f64>;

/// Depth for the weighted order-book imbalance.
pub const OBI_DEPTH_NEAR: usize = 10;
/// Depth for the deep order-book imbalance.
pub const OBI_DEPTH_DEEP: usize = 50;

/// Per-symbol L2 book: price→size per side plus the id of the last applied
/// diff. Mutated only by the [`super::BookSynchroniser`] that owns it.
#[derive(Debug, Clone)]
pub struct OrderBook {
    bids: BTreeMap<Price, f64>,
    asks: BTreeMap<Price, f64>,
    last_update_id: i64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: -1,
        }
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub(crate) fn set_last_update_id(&mut self, id: i64) {
        self.last_update_id = id;
    }

    /// Replace both sides atomically from a snapshot. Zero-size levels are
    /// not stored.
    pub(crate) fn replace(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)], update_id: i64) {
        self.bids.clear();
        self.asks.clear();
        for &(p, q) in bids {
            if q > 0.0 {
                self.bids.insert(OrderedFloat(p), q);
            }
        }
        for &(p, q) in asks {
            if q > 0.0 {
                self.asks.insert(OrderedFloat(p), q);
            }
        }
        self.last_update_id = update_id;
    }

    /// Apply one `(price, size)` pair: zero removes the level, otherwise
    /// upsert.
    pub(crate) fn apply_bid(&mut self, price: f64, size: f64) {
        if size == 0.0 {
            self.bids.remove(&OrderedFloat(price));
        } else {
            self.bids.insert(OrderedFloat(price), size);
        }
    }

    pub(crate) fn apply_ask(&mut self, price: f64, size: f64) {
        if size == 0.0 {
            self.asks.remove(&OrderedFloat(price));
        } else {
            self.asks.insert(OrderedFloat(price), size);
        }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, &q)| (p.into_inner(), q))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, &q)| (p.into_inner(), q))
    }

    /// Midpoint of best bid and ask, with 0 substituted for a missing side.
    pub fn mid_price(&self) -> f64 {
        let bid = self.best_bid().map(|(p, _)| p).unwrap_or(0.0);
        let ask = self.best_ask().map(|(p, _)| p).unwrap_or(0.0);
        (bid + ask) / 2.0
    }

    /// Sum of sizes over the `depth` best bid levels.
    pub fn bid_volume_at_depth(&self, depth: usize) -> f64 {
        self.bids.values().rev().take(depth).sum()
    }

    /// Sum of sizes over the `depth` best ask levels.
    pub fn ask_volume_at_depth(&self, depth: usize) -> f64 {
        self.asks.values().take(depth).sum()
    }

    /// Top `depth` levels per side as `[price, size, cumulative]`, best
    /// first.
    pub fn top_levels(&self, depth: usize) -> (Vec<[f64; 3]>, Vec<[f64; 3]>) {
        let mut bids = Vec::with_capacity(depth);
        let mut cum = 0.0;
        for (p, &q) in self.bids.iter().rev().take(depth) {
            cum += q;
            bids.push([p.into_inner(), q, cum]);
        }

        let mut asks = Vec::with_capacity(depth);
        cum = 0.0;
        for (p, &q) in self.asks.iter().take(depth) {
            cum += q;
            asks.push([p.into_inner(), q, cum]);
        }
        (bids, asks)
    }

    /// Point-in-time view of the quantities the composite calculator needs,
    /// taken under the book lock so no partially-applied diff is observed.
    pub fn view(&self) -> BookView {
        BookView {
            best_bid: self.best_bid().map(|(p, _)| p),
            best_ask: self.best_ask().map(|(p, _)| p),
            bid_near: self.bid_volume_at_depth(OBI_DEPTH_NEAR),
            ask_near: self.ask_volume_at_depth(OBI_DEPTH_NEAR),
            bid_deep: self.bid_volume_at_depth(OBI_DEPTH_DEEP),
            ask_deep: self.ask_volume_at_depth(OBI_DEPTH_DEEP),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only copy of book quantities consumed outside the book lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookView {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub bid_near: f64,
    pub ask_near: f64,
    pub bid_deep: f64,
    pub ask_deep: f64,
}

impl BookView {
    pub fn mid_price(&self) -> f64 {
        (self.best_bid.unwrap_or(0.0) + self.best_ask.unwrap_or(0.0)) / 2.0
    }
}
