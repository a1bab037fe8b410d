//! Depth diff-stream ingest with snapshot resynchronisation.
//!
//! One task per symbol: connect to the `<symbol>@depth@100ms` stream, fetch
//! a REST snapshot, then apply diffs under the sequence rule. A detected
//! gap triggers a fresh snapshot (with backoff) without tearing down the
//! stream; diffs that became stale in the meantime are dropped by the
//! synchroniser.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::book::{Diff, DiffOutcome, Snapshot};
use crate::pipeline::SymbolPipeline;

use super::{parse_levels, Backoff};

#[derive(Debug, Clone)]
pub struct DepthFeedConfig {
    pub ws_base: String,
    pub rest_base: String,
    /// REST depth snapshot level count.
    pub snapshot_limit: u32,
}

#[derive(Debug, Deserialize)]
struct DepthSnapshotWire {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct DepthDiffWire {
    #[serde(rename = "U")]
    first_update_id: i64,
    #[serde(rename = "u")]
    last_update_id: i64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "E", default)]
    event_time_ms: i64,
}

impl DepthDiffWire {
    fn parse(self) -> Result<Diff> {
        Ok(Diff {
            first_update_id: self.first_update_id,
            last_update_id: self.last_update_id,
            bids: parse_levels(&self.bids)?,
            asks: parse_levels(&self.asks)?,
            event_time_ms: self.event_time_ms,
        })
    }
}

/// Spawn the depth ingest task for one symbol.
pub fn spawn_depth_feed(
    pipeline: Arc<SymbolPipeline>,
    cfg: DepthFeedConfig,
    client: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match run_connection(&pipeline, &cfg, &client, &mut shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(symbol = %pipeline.symbol, error = %e, "depth stream error, reconnecting");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(symbol = %pipeline.symbol, "depth feed stopped");
    })
}

/// One connection lifecycle. `Ok(())` means shutdown was requested.
async fn run_connection(
    pipeline: &SymbolPipeline,
    cfg: &DepthFeedConfig,
    client: &reqwest::Client,
    shutdown: &mut watch::Receiver<bool>,
    reconnect_backoff: &mut Backoff,
) -> Result<()> {
    let url = format!(
        "{}/ws/{}@depth@100ms",
        cfg.ws_base,
        pipeline.symbol.to_lowercase()
    );
    let (ws, _) = connect_async(&url)
        .await
        .with_context(|| format!("depth connect {url}"))?;
    reconnect_backoff.reset();
    debug!(symbol = %pipeline.symbol, "depth stream connected");
    let (mut write, mut read) = ws.split();

    // Initial sync; also covers reconnects after a dropped socket.
    if !resync(pipeline, cfg, client, shutdown).await? {
        return Ok(());
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let wire: DepthDiffWire = match serde_json::from_str(&text) {
                        Ok(wire) => wire,
                        Err(e) => {
                            debug!(symbol = %pipeline.symbol, error = %e, "unparseable depth frame");
                            continue;
                        }
                    };
                    let diff = wire.parse()?;
                    let outcome = pipeline.sync.lock().apply_diff(&diff);
                    if outcome == DiffOutcome::Gap {
                        // Envelopes are STALE from here until the snapshot lands.
                        if !resync(pipeline, cfg, client, shutdown).await? {
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(anyhow!("depth stream closed by server: {frame:?}"));
                }
                Some(Err(e)) => return Err(e).context("depth stream read"),
                None => return Err(anyhow!("depth stream ended")),
                _ => {}
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Fetch and apply a fresh snapshot, backing off 1 s → 30 s on failure.
/// Returns `Ok(false)` when shutdown interrupted the attempt.
async fn resync(
    pipeline: &SymbolPipeline,
    cfg: &DepthFeedConfig,
    client: &reqwest::Client,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let mut backoff = Backoff::default();
    loop {
        if *shutdown.borrow() {
            return Ok(false);
        }
        match fetch_snapshot(&pipeline.symbol, cfg, client).await {
            Ok(snapshot) => {
                pipeline.sync.lock().apply_snapshot(&snapshot);
                return Ok(true);
            }
            Err(e) => {
                // Readers keep the last known book; envelopes stay STALE.
                warn!(symbol = %pipeline.symbol, error = %e, "snapshot fetch failed");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

async fn fetch_snapshot(
    symbol: &str,
    cfg: &DepthFeedConfig,
    client: &reqwest::Client,
) -> Result<Snapshot> {
    let url = format!(
        "{}/fapi/v1/depth?symbol={}&limit={}",
        cfg.rest_base, symbol, cfg.snapshot_limit
    );
    let response = client.get(&url).send().await.context("snapshot request")?;
    if !response.status().is_success() {
        return Err(anyhow!("snapshot HTTP {}", response.status()));
    }
    let wire: DepthSnapshotWire = response.json().await.context("snapshot body")?;
    Ok(Snapshot {
        last_update_id: wire.last_update_id,
        bids: parse_levels(&wire.bids)?,
        asks: parse_levels(&wire.asks)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_wire_parses_short_field_names() {
        let text = r#"{"e":"depthUpdate","E":1700000000123,"s":"BTCUSDT",
                       "U":100,"u":105,
                       "b":[["100.0","1.5"],["99.5","0"]],
                       "a":[["100.5","2.0"]]}"#;
        let wire: DepthDiffWire = serde_json::from_str(text).unwrap();
        let diff = wire.parse().unwrap();
        assert_eq!(diff.first_update_id, 100);
        assert_eq!(diff.last_update_id, 105);
        assert_eq!(diff.bids, vec![(100.0, 1.5), (99.5, 0.0)]);
        assert_eq!(diff.asks, vec![(100.5, 2.0)]);
        assert_eq!(diff.event_time_ms, 1700000000123);
    }

    #[test]
    fn snapshot_wire_parses_rest_shape() {
        let text = r#"{"lastUpdateId":160,"E":1,"T":2,
                       "bids":[["50.0","3"]],"asks":[["51.0","4"]]}"#;
        let wire: DepthSnapshotWire = serde_json::from_str(text).unwrap();
        assert_eq!(wire.last_update_id, 160);
        assert_eq!(parse_levels(&wire.bids).unwrap(), vec![(50.0, 3.0)]);
    }
}
