//! Shared domain types, envelope wire format, and application configuration.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for aggressive buys, -1 for aggressive sells.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// A single aggressive trade as consumed from the exchange stream.
/// Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    /// Exchange timestamp.
    pub timestamp_ms: i64,
    /// Local receive timestamp, used for latency accounting.
    pub arrival_ms: i64,
}

impl Trade {
    pub fn signed_quantity(&self) -> f64 {
        self.side.sign() * self.quantity
    }
}

/// Wall-clock milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Envelope wire format (subscriber protocol)
// ============================================================================

/// Connection state tag on a published envelope. `Stale` means the book is
/// resynchronising and levels are elided; metric scalars are still published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BookStateTag {
    #[serde(rename = "LIVE")]
    Live,
    #[serde(rename = "STALE")]
    Stale,
}

/// Current same-side run of aggressive prints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BurstRun {
    pub side: Side,
    pub count: u32,
}

impl Default for BurstRun {
    fn default() -> Self {
        Self {
            side: Side::Buy,
            count: 0,
        }
    }
}

/// Rolling time-and-sales summary over the aggregator window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeAndSales {
    pub aggressive_buy_volume: f64,
    pub aggressive_sell_volume: f64,
    pub trade_count: u64,
    pub prints_per_second: f64,
    pub small_trades: u64,
    pub mid_trades: u64,
    pub large_trades: u64,
    pub bid_hit_ask_lift_ratio: f64,
    pub consecutive_burst: BurstRun,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

/// Per-timeframe cumulative volume delta reading.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CvdFrame {
    pub cvd: f64,
    pub delta: f64,
    pub warm_up_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CvdBlock {
    pub tf1m: CvdFrame,
    pub tf5m: CvdFrame,
    pub tf15m: CvdFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OiSourceTag {
    Real,
    Mock,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestBlock {
    pub open_interest: f64,
    pub oi_change_abs: f64,
    pub oi_change_pct: f64,
    pub oi_delta_window: f64,
    pub source: OiSourceTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingTrend {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingBlock {
    pub rate: f64,
    pub time_to_funding_ms: i64,
    pub trend: FundingTrend,
}

/// Composite scalar block. The four score fields are published as null:
/// no documented computation exists for them upstream.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMetrics {
    pub delta_1s: f64,
    pub delta_5s: f64,
    pub delta_z: f64,
    pub cvd_session: f64,
    pub cvd_slope: f64,
    pub obi_weighted: f64,
    pub obi_deep: f64,
    pub obi_divergence: f64,
    pub vwap: f64,
    pub sweep_fade_score: Option<f64>,
    pub breakout_score: Option<f64>,
    pub regime_weight: Option<f64>,
    pub absorption_score: Option<f64>,
}

/// One published metrics message for a single symbol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: String,
    pub canonical_time_ms: i64,
    pub state: BookStateTag,
    pub price: f64,
    /// Top-of-book levels as `[price, size, cumulative]`, best first.
    pub bids: Vec<[f64; 3]>,
    pub asks: Vec<[f64; 3]>,
    pub time_and_sales: TimeAndSales,
    pub cvd: CvdBlock,
    pub open_interest: OpenInterestBlock,
    pub funding: Option<FundingBlock>,
    pub absorption: Option<f64>,
    pub legacy_metrics: LegacyMetrics,
}

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub symbols: Vec<String>,
    pub max_leverage: u32,
    pub logger_queue_limit: usize,
    pub logger_drop_halt_threshold: u64,
    pub assembler_tick_ms: u64,
    pub trade_window_secs: u64,
    pub oi_poll_secs: u64,
    pub funding_poll_secs: u64,
    /// Combined-stream WebSocket base, e.g. `wss://fstream.binance.com`.
    pub ws_base: String,
    /// Futures REST base for depth snapshots / OI / funding polls.
    pub rest_base: String,
    /// Testnet REST base for the execution session.
    pub testnet_rest_base: String,
    /// Serve synthetic open interest instead of polling the exchange.
    pub oi_mock: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_var("PORT", 8090u16)?;

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let symbols: Vec<String> = std::env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        anyhow::ensure!(!symbols.is_empty(), "SYMBOLS resolved to an empty set");

        Ok(Self {
            host,
            port,
            allowed_origins,
            symbols,
            max_leverage: parse_var("MAX_LEVERAGE", 20u32)?,
            logger_queue_limit: parse_var("LOGGER_QUEUE_LIMIT", 8192usize)?,
            logger_drop_halt_threshold: parse_var("LOGGER_DROP_HALT_THRESHOLD", 5000u64)?,
            assembler_tick_ms: parse_var("ASSEMBLER_TICK_MS", 250u64)?,
            trade_window_secs: parse_var("TRADE_WINDOW_SECS", 60u64)?,
            oi_poll_secs: parse_var("OI_POLL_SECS", 10u64)?,
            funding_poll_secs: parse_var("FUNDING_POLL_SECS", 30u64)?,
            ws_base: std::env::var("WS_BASE")
                .unwrap_or_else(|_| "wss://fstream.binance.com".to_string()),
            rest_base: std::env::var("REST_BASE")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            testnet_rest_base: std::env::var("TESTNET_REST_BASE")
                .unwrap_or_else(|_| "https://testnet.binancefuture.com".to_string()),
            oi_mock: std::env::var("OI_MOCK")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
                .unwrap_or(false),
        })
    }
}

/// Parse an env var with a default; misconfiguration is fatal at startup.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
