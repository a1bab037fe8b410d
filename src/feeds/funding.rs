//! Funding rate polling via the premium index endpoint.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{FundingBlock, FundingTrend};
use crate::pipeline::SymbolPipeline;

/// Rate moves below this are reported as a flat trend.
const TREND_EPS: f64 = 1e-9;

/// Last funding observation for one symbol. `None` until the first
/// successful poll; the envelope's funding block is null until then.
#[derive(Debug, Default)]
pub struct FundingTracker {
    rate: Option<f64>,
    previous_rate: Option<f64>,
    next_funding_ms: i64,
}

impl FundingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rate: f64, next_funding_ms: i64) {
        self.previous_rate = self.rate;
        self.rate = Some(rate);
        self.next_funding_ms = next_funding_ms;
    }

    pub fn trend(&self) -> FundingTrend {
        match (self.rate, self.previous_rate) {
            (Some(rate), Some(previous)) => {
                let delta = rate - previous;
                if delta > TREND_EPS {
                    FundingTrend::Up
                } else if delta < -TREND_EPS {
                    FundingTrend::Down
                } else {
                    FundingTrend::Flat
                }
            }
            _ => FundingTrend::Flat,
        }
    }

    pub fn block(&self, now_ms: i64) -> Option<FundingBlock> {
        self.rate.map(|rate| FundingBlock {
            rate,
            time_to_funding_ms: (self.next_funding_ms - now_ms).max(0),
            trend: self.trend(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FundingPollerConfig {
    pub rest_base: String,
    pub poll_secs: u64,
}

#[derive(Debug, Deserialize)]
struct PremiumIndexWire {
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

/// Spawn the funding poller for one symbol.
pub fn spawn_funding_poller(
    pipeline: Arc<SymbolPipeline>,
    cfg: FundingPollerConfig,
    client: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cfg.poll_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failure_logged = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(symbol = %pipeline.symbol, "funding poller stopped");
                        return;
                    }
                    continue;
                }
            }

            match fetch_premium_index(&pipeline.symbol, &cfg, &client).await {
                Ok((rate, next_ms)) => {
                    pipeline.funding.lock().record(rate, next_ms);
                    failure_logged = false;
                }
                Err(e) => {
                    if !failure_logged {
                        warn!(symbol = %pipeline.symbol, error = %e, "funding poll failed");
                        failure_logged = true;
                    }
                }
            }
        }
    })
}

async fn fetch_premium_index(
    symbol: &str,
    cfg: &FundingPollerConfig,
    client: &reqwest::Client,
) -> Result<(f64, i64)> {
    let url = format!("{}/fapi/v1/premiumIndex?symbol={}", cfg.rest_base, symbol);
    let response = client.get(&url).send().await.context("funding request")?;
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        debug!(symbol, "funding poll rate limited");
        return Err(anyhow!("rate limited"));
    }
    if !response.status().is_success() {
        return Err(anyhow!("funding HTTP {}", response.status()));
    }
    let wire: PremiumIndexWire = response.json().await.context("funding body")?;
    let rate: f64 = wire
        .last_funding_rate
        .parse()
        .with_context(|| format!("bad funding rate {:?}", wire.last_funding_rate))?;
    Ok((rate, wire.next_funding_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_none_before_first_poll() {
        let tracker = FundingTracker::new();
        assert!(tracker.block(0).is_none());
    }

    #[test]
    fn trend_follows_rate_moves() {
        let mut tracker = FundingTracker::new();
        tracker.record(0.0001, 10_000);
        // Single sample: flat.
        assert_eq!(tracker.trend(), FundingTrend::Flat);

        tracker.record(0.0002, 10_000);
        assert_eq!(tracker.trend(), FundingTrend::Up);

        tracker.record(0.00015, 10_000);
        assert_eq!(tracker.trend(), FundingTrend::Down);

        tracker.record(0.00015, 10_000);
        assert_eq!(tracker.trend(), FundingTrend::Flat);
    }

    #[test]
    fn time_to_funding_clamps_at_zero() {
        let mut tracker = FundingTracker::new();
        tracker.record(0.0001, 5_000);
        let block = tracker.block(8_000).unwrap();
        assert_eq!(block.time_to_funding_ms, 0);
        let block = tracker.block(1_000).unwrap();
        assert_eq!(block.time_to_funding_ms, 4_000);
    }

    #[test]
    fn premium_index_wire_parses() {
        let text = r#"{"symbol":"BTCUSDT","markPrice":"50000.00",
                       "lastFundingRate":"0.00010000",
                       "nextFundingTime":1700003600000,"time":1700000000000}"#;
        let wire: PremiumIndexWire = serde_json::from_str(text).unwrap();
        assert_eq!(wire.last_funding_rate, "0.00010000");
        assert_eq!(wire.next_funding_time, 1700003600000);
    }
}
