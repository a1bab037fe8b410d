//! FlowBot Backend - Real-time orderflow telemetry for crypto futures.
//!
//! Per-symbol market-data pipelines (depth sync, trade flow, CVD, open
//! interest, funding) feed a periodic metrics assembler whose envelopes fan
//! out to dashboard subscribers over `/ws`. An orthogonal testnet execution
//! session is managed through the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::HeaderValue,
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use flowbot_backend::api::{routes, ApiState};
use flowbot_backend::execution::ExecutionManager;
use flowbot_backend::feeds::depth::{spawn_depth_feed, DepthFeedConfig};
use flowbot_backend::feeds::funding::{spawn_funding_poller, FundingPollerConfig};
use flowbot_backend::feeds::open_interest::{spawn_oi_poller, OiPollerConfig};
use flowbot_backend::feeds::trades::spawn_trade_feed;
use flowbot_backend::hub::{Delivery, SubscriptionHub};
use flowbot_backend::logging;
use flowbot_backend::models::Config;
use flowbot_backend::pipeline::assembler::spawn_assembler;
use flowbot_backend::pipeline::PipelineRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env().context("invalid configuration")?;
    let logger = logging::init(cfg.logger_queue_limit, cfg.logger_drop_halt_threshold);

    info!(symbols = ?cfg.symbols, "FlowBot backend starting");

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let registry = Arc::new(PipelineRegistry::from_config(&cfg));
    let hub = Arc::new(SubscriptionHub::new());
    let execution = Arc::new(ExecutionManager::new(&cfg, http_client.clone()));

    // Shutdown fan-out: every feed and assembler watches this channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for pipeline in registry.iter() {
        spawn_depth_feed(
            pipeline.clone(),
            DepthFeedConfig {
                ws_base: cfg.ws_base.clone(),
                rest_base: cfg.rest_base.clone(),
                snapshot_limit: 1000,
            },
            http_client.clone(),
            shutdown_rx.clone(),
        );
        spawn_oi_poller(
            pipeline.clone(),
            OiPollerConfig {
                rest_base: cfg.rest_base.clone(),
                poll_secs: cfg.oi_poll_secs,
                mock: cfg.oi_mock,
            },
            http_client.clone(),
            shutdown_rx.clone(),
        );
        spawn_funding_poller(
            pipeline.clone(),
            FundingPollerConfig {
                rest_base: cfg.rest_base.clone(),
                poll_secs: cfg.funding_poll_secs,
            },
            http_client.clone(),
            shutdown_rx.clone(),
        );
        spawn_assembler(
            pipeline.clone(),
            hub.clone(),
            cfg.assembler_tick_ms,
            shutdown_rx.clone(),
        );
    }
    spawn_trade_feed(registry.clone(), cfg.ws_base.clone(), shutdown_rx.clone());

    let state = ApiState {
        registry,
        hub,
        execution,
        logger,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .merge(routes::api_router())
        .route("/ws", get(ws_handler))
        .layer(cors_layer(&cfg))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn cors_layer(cfg: &Config) -> CorsLayer {
    if cfg.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("shutdown signal received, stopping feeds");
    let _ = shutdown_tx.send(true);
}

// ============================================================================
// Subscriber WebSocket
// ============================================================================

#[derive(Deserialize)]
struct WsParams {
    /// Comma-separated symbol list, e.g. `?symbols=BTCUSDT,ETHUSDT`.
    #[serde(default)]
    symbols: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<ApiState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.symbols))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState, symbols: String) {
    let requested: std::collections::HashSet<String> = symbols
        .split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty() && state.registry.contains(s))
        .collect();

    if requested.is_empty() {
        let _ = socket
            .send(Message::Text(
                r#"{"error":"no known symbols requested"}"#.to_string(),
            ))
            .await;
        return;
    }

    let subscription = state.hub.subscribe(requested);
    let id = subscription.id();

    loop {
        tokio::select! {
            delivery = subscription.recv() => match delivery {
                Delivery::Envelope(envelope) => {
                    let text = match serde_json::to_string(envelope.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to serialise envelope: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Delivery::Closed { dropped } => {
                    warn!(id, dropped, "terminating slow subscriber");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "ping" {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    state.hub.unsubscribe(id);
}
