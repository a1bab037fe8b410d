//! Composite metric calculator: order-book imbalance, short-horizon deltas
//! and their Z-score, session CVD with slope, and VWAP.

use std::collections::VecDeque;

use crate::book::BookView;
use crate::models::{now_ms, LegacyMetrics, Trade};

use super::window::RollingWindow;
use super::EPS;

/// Short trade list horizon backing the 1s/5s deltas.
const RECENT_WINDOW_MS: i64 = 10_000;
/// Samples backing the delta Z-score and the session-CVD slope.
const HISTORY_LEN: usize = 60;
/// Minimum history before a Z-score is produced.
const MIN_Z_SAMPLES: usize = 5;

#[derive(Debug)]
pub struct CompositeCalculator {
    /// Signed quantities of trades in the last 10 s. Kept separate from the
    /// time-and-sales window to bound memory independently.
    recent: RollingWindow<f64>,
    delta_history: VecDeque<f64>,
    session_history: VecDeque<f64>,
    cvd_session: f64,
    total_notional: f64,
    total_volume: f64,
}

impl CompositeCalculator {
    pub fn new() -> Self {
        Self {
            recent: RollingWindow::new(RECENT_WINDOW_MS),
            delta_history: VecDeque::with_capacity(HISTORY_LEN),
            session_history: VecDeque::with_capacity(HISTORY_LEN),
            cvd_session: 0.0,
            total_notional: 0.0,
            total_volume: 0.0,
        }
    }

    pub fn on_trade(&mut self, trade: &Trade) {
        let signed = trade.signed_quantity();
        self.recent.push(trade.timestamp_ms, signed);
        self.cvd_session += signed;
        self.total_notional += trade.price * trade.quantity;
        self.total_volume += trade.quantity;
    }

    /// Record one sample of `delta_1s` and of the session CVD into the
    /// histories behind the Z-score and slope. Called on a 1 Hz cadence by
    /// the assembler task.
    pub fn sample(&mut self) {
        let ref_time = self.ref_time_ms();
        let d1 = self.delta_since(ref_time - 1_000);
        push_capped(&mut self.delta_history, d1, HISTORY_LEN);
        push_capped(&mut self.session_history, self.cvd_session, HISTORY_LEN);
    }

    /// Reference time for delta lookbacks: last trade timestamp, or wall
    /// clock when no trade has been seen.
    fn ref_time_ms(&self) -> i64 {
        self.recent.ref_time_ms().unwrap_or_else(now_ms)
    }

    fn delta_since(&mut self, cutoff_ms: i64) -> f64 {
        self.recent.evict();
        self.recent
            .iter()
            .filter(|(ts, _)| *ts >= cutoff_ms)
            .map(|(_, q)| *q)
            .sum()
    }

    pub fn cvd_session(&self) -> f64 {
        self.cvd_session
    }

    /// Compute the composite block against a point-in-time book view.
    pub fn snapshot(&mut self, book: &BookView) -> LegacyMetrics {
        let ref_time = self.ref_time_ms();
        let delta_1s = self.delta_since(ref_time - 1_000);
        let delta_5s = self.delta_since(ref_time - 5_000);

        LegacyMetrics {
            delta_1s,
            delta_5s,
            delta_z: z_score(&self.delta_history, delta_1s),
            cvd_session: self.cvd_session,
            cvd_slope: least_squares_slope(&self.session_history),
            obi_weighted: imbalance(book.bid_near, book.ask_near),
            obi_deep: imbalance(book.bid_deep, book.ask_deep),
            obi_divergence: imbalance(book.bid_near, book.ask_near)
                - imbalance(book.bid_deep, book.ask_deep),
            vwap: if self.total_volume < EPS {
                0.0
            } else {
                self.total_notional / self.total_volume
            },
            sweep_fade_score: None,
            breakout_score: None,
            regime_weight: None,
            absorption_score: None,
        }
    }
}

impl Default for CompositeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn push_capped(history: &mut VecDeque<f64>, value: f64, cap: usize) {
    if history.len() >= cap {
        history.pop_front();
    }
    history.push_back(value);
}

/// Normalised signed difference `(near - far) / (near + far)`, 0 when the
/// denominator vanishes (either side empty).
fn imbalance(bid_volume: f64, ask_volume: f64) -> f64 {
    let total = bid_volume + ask_volume;
    if total < EPS {
        0.0
    } else {
        (bid_volume - ask_volume) / total
    }
}

/// Standard score of `value` against `history` using population variance.
fn z_score(history: &VecDeque<f64>, value: f64) -> f64 {
    if history.len() < MIN_Z_SAMPLES {
        return 0.0;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std < EPS {
        0.0
    } else {
        (value - mean) / std
    }
}

/// Least-squares slope of `history` against integer x positions.
fn least_squares_slope(history: &VecDeque<f64>) -> f64 {
    let n = history.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let sum_x = (0..n).sum::<usize>() as f64;
    let sum_x2 = (0..n).map(|x| x * x).sum::<usize>() as f64;
    let sum_y: f64 = history.iter().sum();
    let sum_xy: f64 = history.iter().enumerate().map(|(x, y)| x as f64 * y).sum();

    let denom = nf * sum_x2 - sum_x * sum_x;
    if denom.abs() < EPS {
        0.0
    } else {
        (nf * sum_xy - sum_x * sum_y) / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBook;
    use crate::models::Side;

    fn trade(side: Side, qty: f64, price: f64, ts: i64) -> Trade {
        Trade {
            price,
            quantity: qty,
            side,
            timestamp_ms: ts,
            arrival_ms: ts,
        }
    }

    fn seeded_book() -> OrderBook {
        let mut sync = crate::book::BookSynchroniser::new("TEST");
        sync.apply_snapshot(&crate::book::Snapshot {
            last_update_id: 1,
            bids: vec![(100.0, 10.0), (99.0, 5.0)],
            asks: vec![(101.0, 7.0), (102.0, 3.0)],
        });
        sync.book().clone()
    }

    #[test]
    fn obi_on_shallow_book() {
        let mut calc = CompositeCalculator::new();
        let view = seeded_book().view();
        let m = calc.snapshot(&view);
        // (15 - 10) / (15 + 10)
        assert!((m.obi_weighted - 0.2).abs() < 1e-12);
        // Depth 50 consumes the same four levels.
        assert!((m.obi_deep - 0.2).abs() < 1e-12);
        assert!(m.obi_divergence.abs() < 1e-12);
    }

    #[test]
    fn obi_is_zero_on_empty_side() {
        let mut calc = CompositeCalculator::new();
        let m = calc.snapshot(&BookView::default());
        assert_eq!(m.obi_weighted, 0.0);
        assert_eq!(m.obi_deep, 0.0);
        assert_eq!(m.obi_divergence, 0.0);
    }

    #[test]
    fn deltas_vwap_and_session_cvd() {
        let now = 1_000_000;
        let mut calc = CompositeCalculator::new();
        calc.on_trade(&trade(Side::Buy, 3.0, 99.0, now - 4_000));
        calc.on_trade(&trade(Side::Buy, 2.0, 100.0, now - 500));
        calc.on_trade(&trade(Side::Sell, 1.0, 101.0, now - 400));

        let m = calc.snapshot(&BookView::default());
        assert!((m.delta_1s - 1.0).abs() < 1e-12);
        assert!((m.delta_5s - 4.0).abs() < 1e-12);
        assert!((m.vwap - 598.0 / 6.0).abs() < 1e-12);
        assert_eq!(m.cvd_session, 4.0);
    }

    #[test]
    fn session_cvd_is_exact_signed_sum() {
        let mut calc = CompositeCalculator::new();
        let mut expected = 0.0;
        for i in 0..500_i64 {
            let (side, qty) = if i % 3 == 0 {
                (Side::Sell, 0.5 + (i % 7) as f64)
            } else {
                (Side::Buy, 1.0 + (i % 5) as f64)
            };
            expected += if side == Side::Buy { qty } else { -qty };
            calc.on_trade(&trade(side, qty, 100.0, i * 10));
        }
        assert!((calc.cvd_session() - expected).abs() < 1e-9);
    }

    #[test]
    fn z_score_needs_history_and_spread() {
        let mut calc = CompositeCalculator::new();
        calc.on_trade(&trade(Side::Buy, 1.0, 100.0, 1_000));

        // Fewer than five samples: no score.
        for _ in 0..4 {
            calc.sample();
        }
        assert_eq!(calc.snapshot(&BookView::default()).delta_z, 0.0);

        // Identical samples: zero variance, still no score.
        calc.sample();
        assert_eq!(calc.snapshot(&BookView::default()).delta_z, 0.0);
    }

    #[test]
    fn z_score_reacts_once_history_varies() {
        let mut calc = CompositeCalculator::new();
        let base = 1_000_000;
        for i in 0..6_i64 {
            // Varying sizes so the sampled delta history has spread.
            calc.on_trade(&trade(Side::Buy, 1.0 + (i % 3) as f64, 100.0, base + i * 2_000));
            calc.sample();
        }
        // Burst of buys right at the reference time.
        calc.on_trade(&trade(Side::Buy, 50.0, 100.0, base + 12_000));
        let m = calc.snapshot(&BookView::default());
        assert!(m.delta_z > 1.0, "delta_z = {}", m.delta_z);
    }

    #[test]
    fn slope_tracks_monotone_session_cvd() {
        let mut calc = CompositeCalculator::new();
        for i in 0..10_i64 {
            calc.on_trade(&trade(Side::Buy, 2.0, 100.0, i * 1_000));
            calc.sample();
        }
        let m = calc.snapshot(&BookView::default());
        // Session CVD grows by 2.0 per sample.
        assert!((m.cvd_slope - 2.0).abs() < 1e-9);

        let mut flat = CompositeCalculator::new();
        flat.sample();
        assert_eq!(flat.snapshot(&BookView::default()).cvd_slope, 0.0);
    }
}
