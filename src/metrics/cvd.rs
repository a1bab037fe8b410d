//! Multi-timeframe cumulative volume delta.

use crate::models::Trade;

use super::window::RollingWindow;

/// Default timeframes: label plus window duration.
pub const DEFAULT_TIMEFRAMES: [(&str, i64); 3] = [
    ("tf1m", 60_000),
    ("tf5m", 300_000),
    ("tf15m", 900_000),
];

/// One timeframe's reading at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct CvdReading {
    pub label: &'static str,
    pub cvd: f64,
    /// Equal to `cvd` under the one-window-per-timeframe definition.
    pub delta: f64,
    /// How much of the window duration is backed by observed data, capped
    /// at 100. Consumers should treat anything below 100 as preliminary.
    pub warm_up_pct: f64,
}

#[derive(Debug)]
struct CvdBucket {
    label: &'static str,
    window: RollingWindow<f64>,
}

/// Independent signed-quantity window per configured timeframe.
#[derive(Debug)]
pub struct CvdCalculator {
    buckets: Vec<CvdBucket>,
}

impl CvdCalculator {
    pub fn new(timeframes: &[(&'static str, i64)]) -> Self {
        Self {
            buckets: timeframes
                .iter()
                .map(|&(label, duration_ms)| CvdBucket {
                    label,
                    window: RollingWindow::new(duration_ms),
                })
                .collect(),
        }
    }

    pub fn on_trade(&mut self, trade: &Trade) {
        let signed = trade.signed_quantity();
        for bucket in &mut self.buckets {
            bucket.window.push(trade.timestamp_ms, signed);
        }
    }

    /// Current reading per timeframe. `now_ms` drives the warm-up figure
    /// only; eviction stays pinned to the max trade timestamp seen.
    pub fn read(&mut self, now_ms: i64) -> Vec<CvdReading> {
        self.buckets
            .iter_mut()
            .map(|bucket| {
                bucket.window.evict();
                let cvd: f64 = bucket.window.iter().map(|(_, q)| *q).sum();
                let duration = bucket.window.duration_ms() as f64;
                let warm_up_pct = match bucket.window.oldest_ms() {
                    Some(oldest) => ((now_ms - oldest) as f64 / duration * 100.0).min(100.0),
                    None => 0.0,
                };
                CvdReading {
                    label: bucket.label,
                    cvd,
                    delta: cvd,
                    warm_up_pct,
                }
            })
            .collect()
    }

    pub fn reading(&mut self, label: &str, now_ms: i64) -> Option<CvdReading> {
        self.read(now_ms).into_iter().find(|r| r.label == label)
    }
}

impl Default for CvdCalculator {
    fn default() -> Self {
        Self::new(&DEFAULT_TIMEFRAMES)
    }
}
