//! Open interest polling with a rolling 60 s baseline.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{now_ms, OiSourceTag, OpenInterestBlock};
use crate::pipeline::SymbolPipeline;

/// History retained behind the baseline.
const HISTORY_MS: i64 = 300_000;
/// Baseline age after which it is re-pinned inside the last 60 s.
const BASELINE_WINDOW_MS: i64 = 60_000;

/// Rolling open interest state for one symbol. Written only by its poller.
#[derive(Debug)]
pub struct OiTracker {
    current: f64,
    previous: f64,
    baseline: f64,
    baseline_ts_ms: i64,
    history: VecDeque<(i64, f64)>,
    source: OiSourceTag,
}

impl OiTracker {
    pub fn new(source: OiSourceTag) -> Self {
        Self {
            current: 0.0,
            previous: 0.0,
            baseline: 0.0,
            baseline_ts_ms: 0,
            history: VecDeque::new(),
            source,
        }
    }

    /// Record one successful poll.
    pub fn record(&mut self, value: f64, now_ms: i64) {
        if self.current == 0.0 {
            // First sample pins the baseline.
            self.baseline = value;
            self.baseline_ts_ms = now_ms;
        } else {
            self.previous = self.current;
        }
        self.current = value;

        self.history.push_back((now_ms, value));
        while let Some(&(ts, _)) = self.history.front() {
            if ts < now_ms - HISTORY_MS {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if now_ms - self.baseline_ts_ms >= BASELINE_WINDOW_MS {
            let cutoff = now_ms - BASELINE_WINDOW_MS;
            if let Some(&(ts, v)) = self.history.iter().find(|(ts, _)| *ts >= cutoff) {
                self.baseline = v;
                self.baseline_ts_ms = ts;
            }
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn previous(&self) -> f64 {
        self.previous
    }

    pub fn block(&self) -> OpenInterestBlock {
        let change_abs = self.current - self.baseline;
        let change_pct = if self.baseline <= 0.0 {
            0.0
        } else {
            change_abs / self.baseline * 100.0
        };
        OpenInterestBlock {
            open_interest: self.current,
            oi_change_abs: change_abs,
            oi_change_pct: change_pct,
            oi_delta_window: change_abs,
            source: self.source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OiPollerConfig {
    pub rest_base: String,
    pub poll_secs: u64,
    pub mock: bool,
}

#[derive(Debug, Deserialize)]
struct OpenInterestWire {
    #[serde(rename = "openInterest")]
    open_interest: String,
}

/// Spawn the open interest poller for one symbol.
pub fn spawn_oi_poller(
    pipeline: Arc<SymbolPipeline>,
    cfg: OiPollerConfig,
    client: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cfg.poll_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // One log per transient failure window.
        let mut failure_logged = false;
        // Seed for the synthetic source.
        let mut mock_value = 1_000_000.0f64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(symbol = %pipeline.symbol, "open interest poller stopped");
                        return;
                    }
                    continue;
                }
            }

            if cfg.mock {
                mock_value *= 1.0 + rand::thread_rng().gen_range(-0.0005..0.0005);
                pipeline.oi.lock().record(mock_value, now_ms());
                continue;
            }

            match fetch_open_interest(&pipeline.symbol, &cfg, &client).await {
                Ok(value) => {
                    pipeline.oi.lock().record(value, now_ms());
                    failure_logged = false;
                }
                Err(PollError::RateLimited) => {
                    // 429s are expected under burst; keep quiet.
                    debug!(symbol = %pipeline.symbol, "open interest poll rate limited");
                }
                Err(PollError::Other(e)) => {
                    // Last known value persists; log once per failure window.
                    if !failure_logged {
                        warn!(symbol = %pipeline.symbol, error = %e, "open interest poll failed");
                        failure_logged = true;
                    }
                }
            }
        }
    })
}

enum PollError {
    RateLimited,
    Other(anyhow::Error),
}

async fn fetch_open_interest(
    symbol: &str,
    cfg: &OiPollerConfig,
    client: &reqwest::Client,
) -> std::result::Result<f64, PollError> {
    let url = format!("{}/fapi/v1/openInterest?symbol={}", cfg.rest_base, symbol);
    let response = client
        .get(&url)
        .send()
        .await
        .context("open interest request")
        .map_err(PollError::Other)?;

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return Err(PollError::RateLimited);
    }
    if !response.status().is_success() {
        return Err(PollError::Other(anyhow!(
            "open interest HTTP {}",
            response.status()
        )));
    }

    let wire: OpenInterestWire = response
        .json()
        .await
        .context("open interest body")
        .map_err(PollError::Other)?;
    parse_value(&wire.open_interest).map_err(PollError::Other)
}

fn parse_value(raw: &str) -> Result<f64> {
    let value: f64 = raw
        .parse()
        .with_context(|| format!("bad open interest {raw:?}"))?;
    anyhow::ensure!(value >= 0.0, "negative open interest {value}");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_pins_baseline() {
        let mut oi = OiTracker::new(OiSourceTag::Real);
        oi.record(1_000.0, 10_000);
        let block = oi.block();
        assert_eq!(block.open_interest, 1_000.0);
        assert_eq!(block.oi_change_abs, 0.0);
        assert_eq!(block.oi_change_pct, 0.0);
    }

    #[test]
    fn change_is_measured_against_baseline() {
        let mut oi = OiTracker::new(OiSourceTag::Real);
        oi.record(1_000.0, 10_000);
        oi.record(1_050.0, 20_000);
        let block = oi.block();
        assert_eq!(block.oi_change_abs, 50.0);
        assert!((block.oi_change_pct - 5.0).abs() < 1e-12);
        assert_eq!(block.oi_delta_window, block.oi_change_abs);
        assert_eq!(oi.previous(), 1_000.0);
    }

    #[test]
    fn baseline_repins_after_sixty_seconds() {
        let mut oi = OiTracker::new(OiSourceTag::Real);
        oi.record(1_000.0, 0);
        oi.record(1_100.0, 30_000);
        // 70 s after the first pin, the baseline moves to the oldest
        // sample within the last 60 s.
        oi.record(1_200.0, 70_000);
        let block = oi.block();
        assert_eq!(block.oi_change_abs, 1_200.0 - 1_100.0);
    }

    #[test]
    fn history_is_culled_to_five_minutes() {
        let mut oi = OiTracker::new(OiSourceTag::Real);
        for i in 0..100i64 {
            oi.record(1_000.0 + i as f64, i * 10_000);
        }
        assert!(oi.history.front().unwrap().0 >= 990_000 - HISTORY_MS);
    }

    #[test]
    fn zero_baseline_yields_zero_pct() {
        let mut oi = OiTracker::new(OiSourceTag::Mock);
        // Exchange reported zero OI on the first sample.
        oi.record(0.0, 0);
        oi.record(10.0, 1_000);
        let block = oi.block();
        assert_eq!(block.oi_change_pct, 0.0);
    }

    #[test]
    fn wire_value_parses_decimal_string() {
        assert_eq!(parse_value("10659.509").unwrap(), 10659.509);
        assert!(parse_value("-1").is_err());
        assert!(parse_value("abc").is_err());
    }
}
