//! Aggressive trade ingest over a combined `@aggTrade` stream.
//!
//! All configured symbols share one socket; trades are routed to their
//! pipeline by the symbol inside the payload. Reconnects keep aggregator
//! state intact: the windows live in the pipeline, not here.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{now_ms, Side, Trade};
use crate::pipeline::PipelineRegistry;

use super::Backoff;

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: AggTradeWire,
}

#[derive(Debug, Deserialize)]
struct AggTradeWire {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time_ms: i64,
    /// Buyer is maker: the aggressor sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

impl AggTradeWire {
    fn parse(&self, arrival_ms: i64) -> Result<Trade> {
        Ok(Trade {
            price: self
                .price
                .parse()
                .with_context(|| format!("bad trade price {:?}", self.price))?,
            quantity: self
                .quantity
                .parse()
                .with_context(|| format!("bad trade quantity {:?}", self.quantity))?,
            side: if self.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            timestamp_ms: self.trade_time_ms,
            arrival_ms,
        })
    }
}

/// Spawn the shared trade ingest task.
pub fn spawn_trade_feed(
    registry: Arc<PipelineRegistry>,
    ws_base: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let streams: Vec<String> = registry
            .symbols()
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", ws_base, streams.join("/"));

        let mut backoff = Backoff::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match run_connection(&registry, &url, &mut shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "trade stream error, reconnecting");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!("trade feed stopped");
    })
}

async fn run_connection(
    registry: &PipelineRegistry,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
    reconnect_backoff: &mut Backoff,
) -> Result<()> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("trade connect {url}"))?;
    reconnect_backoff.reset();
    debug!("trade stream connected");
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: CombinedFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(error = %e, "unparseable trade frame");
                            continue;
                        }
                    };
                    let trade = match frame.data.parse(now_ms()) {
                        Ok(trade) => trade,
                        Err(e) => {
                            debug!(error = %e, "bad trade payload");
                            continue;
                        }
                    };
                    if let Some(pipeline) = registry.get(&frame.data.symbol.to_ascii_uppercase()) {
                        pipeline.record_trade(trade);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(anyhow!("trade stream closed by server: {frame:?}"));
                }
                Some(Err(e)) => return Err(e).context("trade stream read"),
                None => return Err(anyhow!("trade stream ended")),
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
