//! Rolling time-and-sales aggregation: aggressive volume, size buckets,
//! burst runs, print rate and feed latency.

use crate::models::{BurstRun, Side, TimeAndSales, Trade};

use super::window::RollingWindow;

/// Trades observed before size thresholds freeze.
const CALIBRATION_TARGET: usize = 100;

/// Size-bucket boundaries. `small_max` is the 25th percentile of the
/// calibration sample, `large_min` the 75th; frozen once calibrated.
#[derive(Debug, Clone, Copy)]
pub struct SizeThresholds {
    pub small_max: f64,
    pub large_min: f64,
}

#[derive(Debug)]
pub struct TradeFlowAggregator {
    window: RollingWindow<Trade>,
    window_secs: f64,
    frozen: Option<SizeThresholds>,
    calibration: Vec<f64>,
    burst: BurstRun,
    last_side: Option<Side>,
}

impl TradeFlowAggregator {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: RollingWindow::new(window_secs as i64 * 1_000),
            window_secs: window_secs as f64,
            frozen: None,
            calibration: Vec::with_capacity(CALIBRATION_TARGET),
            burst: BurstRun::default(),
            last_side: None,
        }
    }

    pub fn add_trade(&mut self, trade: Trade) {
        if self.frozen.is_none() {
            self.calibration.push(trade.quantity);
            if self.calibration.len() >= CALIBRATION_TARGET {
                self.frozen = Some(percentile_thresholds(&self.calibration));
                self.calibration.clear();
            }
        }

        match self.last_side {
            Some(side) if side == trade.side => self.burst.count += 1,
            _ => {
                self.burst = BurstRun {
                    side: trade.side,
                    count: 1,
                }
            }
        }
        self.last_side = Some(trade.side);

        self.window.push(trade.timestamp_ms, trade);
    }

    /// Bucket boundaries in force: frozen after calibration, provisional
    /// percentiles of the sample collected so far before that.
    pub fn thresholds(&self) -> SizeThresholds {
        match self.frozen {
            Some(t) => t,
            None if self.calibration.len() >= 4 => percentile_thresholds(&self.calibration),
            None => SizeThresholds {
                small_max: 0.0,
                large_min: f64::INFINITY,
            },
        }
    }

    /// Summarise the current window.
    pub fn summary(&mut self) -> TimeAndSales {
        self.window.evict();
        let thresholds = self.thresholds();

        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut buy_count = 0u64;
        let mut sell_count = 0u64;
        let mut small = 0u64;
        let mut mid = 0u64;
        let mut large = 0u64;
        let mut latency_sum = 0.0;

        for (_, trade) in self.window.iter() {
            match trade.side {
                Side::Buy => {
                    buy_volume += trade.quantity;
                    buy_count += 1;
                }
                Side::Sell => {
                    sell_volume += trade.quantity;
                    sell_count += 1;
                }
            }
            if trade.quantity <= thresholds.small_max {
                small += 1;
            } else if trade.quantity >= thresholds.large_min {
                large += 1;
            } else {
                mid += 1;
            }
            latency_sum += (trade.arrival_ms - trade.timestamp_ms) as f64;
        }

        let count = buy_count + sell_count;
        TimeAndSales {
            aggressive_buy_volume: buy_volume,
            aggressive_sell_volume: sell_volume,
            trade_count: count,
            prints_per_second: count as f64 / self.window_secs,
            small_trades: small,
            mid_trades: mid,
            large_trades: large,
            bid_hit_ask_lift_ratio: buy_count as f64 / sell_count.max(1) as f64,
            consecutive_burst: self.burst,
            avg_latency_ms: (count > 0).then(|| latency_sum / count as f64),
        }
    }

    /// Drop all state, including frozen size thresholds.
    pub fn reset(&mut self) {
        self.window.clear();
        self.frozen = None;
        self.calibration.clear();
        self.burst = BurstRun::default();
        self.last_side = None;
    }
}

fn percentile_thresholds(sample: &[f64]) -> SizeThresholds {
    let mut sorted: Vec<f64> = sample.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    SizeThresholds {
        small_max: percentile(&sorted, 0.25),
        large_min: percentile(&sorted, 0.75),
    }
}

/// Nearest-rank percentile over an ascending sample.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(side: Side, qty: f64, ts: i64) -> Trade {
        Trade {
            price: 100.0,
            quantity: qty,
            side,
            timestamp_ms: ts,
            arrival_ms: ts + 5,
        }
    }

    #[test]
    fn volumes_counts_and_ratio() {
        let mut agg = TradeFlowAggregator::new(60);
        agg.add_trade(trade(Side::Buy, 2.0, 1_000));
        agg.add_trade(trade(Side::Buy, 3.0, 2_000));
        agg.add_trade(trade(Side::Sell, 1.0, 3_000));

        let s = agg.summary();
        assert_eq!(s.aggressive_buy_volume, 5.0);
        assert_eq!(s.aggressive_sell_volume, 1.0);
        assert_eq!(s.trade_count, 3);
        assert_eq!(s.bid_hit_ask_lift_ratio, 2.0);
        assert_eq!(s.prints_per_second, 3.0 / 60.0);
        assert_eq!(s.avg_latency_ms, Some(5.0));
    }

    #[test]
    fn ratio_guards_division_by_zero() {
        let mut agg = TradeFlowAggregator::new(60);
        agg.add_trade(trade(Side::Buy, 1.0, 1_000));
        let s = agg.summary();
        assert_eq!(s.bid_hit_ask_lift_ratio, 1.0);
    }

    #[test]
    fn burst_runs_track_consecutive_sides() {
        let mut agg = TradeFlowAggregator::new(60);
        for i in 0..3 {
            agg.add_trade(trade(Side::Sell, 1.0, i));
        }
        let s = agg.summary();
        assert_eq!(s.consecutive_burst.side, Side::Sell);
        assert_eq!(s.consecutive_burst.count, 3);

        agg.add_trade(trade(Side::Buy, 1.0, 10));
        let s = agg.summary();
        assert_eq!(s.consecutive_burst.side, Side::Buy);
        assert_eq!(s.consecutive_burst.count, 1);
    }

    #[test]
    fn old_trades_fall_out_of_the_window() {
        let mut agg = TradeFlowAggregator::new(60);
        agg.add_trade(trade(Side::Buy, 1.0, 0));
        agg.add_trade(trade(Side::Buy, 1.0, 61_000));
        let s = agg.summary();
        assert_eq!(s.trade_count, 1);
    }

    #[test]
    fn thresholds_freeze_after_calibration() {
        let mut agg = TradeFlowAggregator::new(60);
        for i in 0..CALIBRATION_TARGET {
            agg.add_trade(trade(Side::Buy, (i + 1) as f64, i as i64));
        }
        let frozen = agg.thresholds();
        assert_eq!(frozen.small_max, 25.0);
        assert_eq!(frozen.large_min, 75.0);

        // Later outliers no longer move the buckets.
        agg.add_trade(trade(Side::Buy, 10_000.0, 200));
        let after = agg.thresholds();
        assert_eq!(after.small_max, frozen.small_max);
        assert_eq!(after.large_min, frozen.large_min);

        // A reset re-opens calibration.
        agg.reset();
        assert_eq!(agg.thresholds().small_max, 0.0);
    }

    #[test]
    fn size_buckets_split_on_thresholds() {
        let mut agg = TradeFlowAggregator::new(60);
        for i in 0..CALIBRATION_TARGET {
            agg.add_trade(trade(Side::Buy, (i + 1) as f64, i as i64));
        }
        let s = agg.summary();
        // 1..=25 small, 26..=74 mid, 75..=100 large.
        assert_eq!(s.small_trades, 25);
        assert_eq!(s.mid_trades, 49);
        assert_eq!(s.large_trades, 26);
    }
}
