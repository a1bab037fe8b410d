//! Exchange-facing adapters: depth diff stream, aggressive trade stream,
//! open interest and funding pollers.
//!
//! Every feed honours the process shutdown signal and reconnects with
//! jittered exponential backoff. Aggregator state lives in the pipeline,
//! not in the feeds, so reconnects never reset trade-derived metrics.

pub mod depth;
pub mod funding;
pub mod open_interest;
pub mod trades;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::time::Duration;

/// Jittered exponential backoff, 1 s doubling to 30 s by default.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            next: base,
            base,
            max,
        }
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }

    /// Current delay with ±20% jitter; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        delay.mul_f64(jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Parse `[["price","size"], …]` wire levels.
pub(crate) fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(f64, f64)>> {
    raw.iter()
        .map(|[p, q]| {
            let price: f64 = p.parse().with_context(|| format!("bad price {p:?}"))?;
            let size: f64 = q.parse().with_context(|| format!("bad size {q:?}"))?;
            Ok((price, size))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut raw = Vec::new();
        for _ in 0..7 {
            // Strip jitter by observing the pre-jitter schedule.
            raw.push(b.next);
            b.next_delay();
        }
        let secs: Vec<u64> = raw.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        b.reset();
        assert_eq!(b.next, Duration::from_secs(1));
    }

    #[test]
    fn parses_wire_levels() {
        let raw = [
            ["100.5".to_string(), "2.0".to_string()],
            ["99.0".to_string(), "0".to_string()],
        ];
        let parsed = parse_levels(&raw).unwrap();
        assert_eq!(parsed, vec![(100.5, 2.0), (99.0, 0.0)]);
        assert!(parse_levels(&[["x".to_string(), "1".to_string()]]).is_err());
    }
}
