//! Single testnet execution session.
//!
//! Owns the connected/enabled/symbol/settings state driven by the admin
//! surface, the symbol filters fetched from the testnet exchange, the
//! sizing ramp, and the execution-quality freeze flag. All transitions are
//! serialised behind one lock; metric publication is unaffected by any of
//! them.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::Config;

use super::ramp::{RampConfig, RampState, SizingQuery, SizingRamp, SizingResult};

/// Consecutive losing closes before the session freezes.
const FREEZE_FAIL_STREAK: u32 = 6;

/// Tradeable-symbol constraints from the testnet exchange info.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolFilters {
    pub symbol: String,
    pub step_size: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    pub leverage: u32,
    pub ramp: RampConfig,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            leverage: 5,
            ramp: RampConfig::default(),
        }
    }
}

/// Snapshot returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub connected: bool,
    pub enabled: bool,
    pub frozen: bool,
    pub symbol: String,
    pub settings: ExecutionSettings,
    pub ramp: RampState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sizing: Option<SizingResult>,
}

#[derive(Debug)]
struct SessionState {
    connected: bool,
    enabled: bool,
    frozen: bool,
    symbol: String,
    settings: ExecutionSettings,
    ramp: SizingRamp,
    fail_streak: u32,
    filters: HashMap<String, SymbolFilters>,
    last_sizing: Option<SizingResult>,
}

pub struct ExecutionManager {
    inner: Mutex<SessionState>,
    client: reqwest::Client,
    testnet_rest_base: String,
    max_leverage: u32,
}

impl ExecutionManager {
    pub fn new(cfg: &Config, client: reqwest::Client) -> Self {
        let settings = ExecutionSettings::default();
        Self {
            inner: Mutex::new(SessionState {
                connected: false,
                enabled: false,
                frozen: false,
                symbol: cfg.symbols.first().cloned().unwrap_or_default(),
                ramp: SizingRamp::new(settings.ramp.clone()),
                settings,
                fail_streak: 0,
                filters: HashMap::new(),
                last_sizing: None,
            }),
            client,
            testnet_rest_base: cfg.testnet_rest_base.clone(),
            max_leverage: cfg.max_leverage,
        }
    }

    /// Connect the session: fetch testnet exchange info and arm the state.
    pub async fn connect(&self) -> Result<ExecutionStatus> {
        let filters = self.fetch_exchange_info().await?;
        let mut state = self.inner.lock();
        state.filters = filters
            .into_iter()
            .map(|f| (f.symbol.clone(), f))
            .collect();
        state.connected = true;
        info!(symbols = state.filters.len(), "execution session connected");
        Ok(Self::status_of(&state))
    }

    pub fn disconnect(&self) -> ExecutionStatus {
        let mut state = self.inner.lock();
        state.connected = false;
        state.enabled = false;
        info!("execution session disconnected");
        Self::status_of(&state)
    }

    /// Arm or disarm order placement. Re-arming clears a freeze.
    pub fn set_enabled(&self, enabled: bool) -> Result<ExecutionStatus> {
        let mut state = self.inner.lock();
        if enabled && !state.connected {
            return Err(anyhow!("execution session is not connected"));
        }
        state.enabled = enabled;
        if enabled {
            state.frozen = false;
            state.fail_streak = 0;
        }
        Ok(Self::status_of(&state))
    }

    pub fn update_settings(&self, mut settings: ExecutionSettings) -> Result<ExecutionStatus> {
        if settings.leverage == 0 {
            return Err(anyhow!("leverage must be positive"));
        }
        settings.leverage = settings.leverage.min(self.max_leverage);

        let mut state = self.inner.lock();
        state.ramp.reconfigure(settings.ramp.clone());
        state.settings = settings;
        Ok(Self::status_of(&state))
    }

    pub fn set_symbol(&self, symbol: &str) -> Result<ExecutionStatus> {
        let symbol = symbol.to_ascii_uppercase();
        let mut state = self.inner.lock();
        if state.connected && !state.filters.contains_key(&symbol) {
            return Err(anyhow!("unknown symbol {symbol}"));
        }
        state.symbol = symbol;
        Ok(Self::status_of(&state))
    }

    pub fn status(&self) -> ExecutionStatus {
        Self::status_of(&self.inner.lock())
    }

    /// Feed one closed trade's realised P&L into the ramp and the freeze
    /// assessment.
    pub fn on_trade_closed(&self, pnl: f64) {
        let mut state = self.inner.lock();
        state.ramp.on_trade_closed(pnl);
        if pnl > 0.0 {
            state.fail_streak = 0;
        } else {
            state.fail_streak += 1;
            if state.fail_streak >= FREEZE_FAIL_STREAK && !state.frozen {
                state.frozen = true;
                warn!(
                    streak = state.fail_streak,
                    "execution quality bad, freezing order placement"
                );
            }
        }
    }

    /// Size the next order for the active symbol at the given mark price.
    pub fn quote(&self, mark_price: f64) -> Result<SizingResult> {
        let mut state = self.inner.lock();
        if !state.connected || !state.enabled {
            return Err(anyhow!("execution session is not armed"));
        }
        if state.frozen {
            return Err(anyhow!("execution session is frozen"));
        }
        let filters = state
            .filters
            .get(&state.symbol)
            .ok_or_else(|| anyhow!("no filters for {}", state.symbol))?;

        let query = SizingQuery {
            mark_price,
            step_size: filters.step_size,
            min_notional: filters.min_notional,
            leverage: state.settings.leverage,
        };
        let result = state.ramp.size_order(&query);
        state.last_sizing = Some(result);
        Ok(result)
    }

    pub async fn exchange_info(&self) -> Result<Vec<SymbolFilters>> {
        {
            let state = self.inner.lock();
            if !state.filters.is_empty() {
                let mut cached: Vec<SymbolFilters> = state.filters.values().cloned().collect();
                cached.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                return Ok(cached);
            }
        }
        self.fetch_exchange_info().await
    }

    fn status_of(state: &SessionState) -> ExecutionStatus {
        ExecutionStatus {
            connected: state.connected,
            enabled: state.enabled,
            frozen: state.frozen,
            symbol: state.symbol.clone(),
            settings: state.settings.clone(),
            ramp: state.ramp.state(),
            last_sizing: state.last_sizing,
        }
    }

    async fn fetch_exchange_info(&self) -> Result<Vec<SymbolFilters>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.testnet_rest_base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("exchange info request")?;
        if !response.status().is_success() {
            return Err(anyhow!("exchange info HTTP {}", response.status()));
        }
        let wire: ExchangeInfoWire = response.json().await.context("exchange info body")?;
        Ok(wire
            .symbols
            .into_iter()
            .map(SymbolWire::parse_filters)
            .collect())
    }

    /// Seed filters directly, bypassing the REST fetch. Test hook.
    #[doc(hidden)]
    pub fn connect_with_filters(&self, filters: Vec<SymbolFilters>) {
        let mut state = self.inner.lock();
        state.filters = filters
            .into_iter()
            .map(|f| (f.symbol.clone(), f))
            .collect();
        state.connected = true;
    }
}

// ----------------------------------------------------------------------------
// Exchange info wire format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExchangeInfoWire {
    symbols: Vec<SymbolWire>,
}

#[derive(Debug, Deserialize)]
struct SymbolWire {
    symbol: String,
    #[serde(default)]
    filters: Vec<FilterWire>,
}

#[derive(Debug, Deserialize)]
struct FilterWire {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    notional: Option<String>,
}

impl SymbolWire {
    fn parse_filters(self) -> SymbolFilters {
        let mut out = SymbolFilters {
            symbol: self.symbol,
            step_size: 0.001,
            tick_size: 0.1,
            min_notional: 5.0,
        };
        for filter in self.filters {
            match filter.filter_type.as_str() {
                "LOT_SIZE" => {
                    if let Some(v) = filter.step_size.and_then(|s| s.parse().ok()) {
                        out.step_size = v;
                    }
                }
                "PRICE_FILTER" => {
                    if let Some(v) = filter.tick_size.and_then(|s| s.parse().ok()) {
                        out.tick_size = v;
                    }
                }
                "MIN_NOTIONAL" => {
                    if let Some(v) = filter.notional.and_then(|s| s.parse().ok()) {
                        out.min_notional = v;
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_origins: vec!["*".to_string()],
            symbols: vec!["BTCUSDT".to_string()],
            max_leverage: 20,
            logger_queue_limit: 1024,
            logger_drop_halt_threshold: 0,
            assembler_tick_ms: 250,
            trade_window_secs: 60,
            oi_poll_secs: 10,
            funding_poll_secs: 30,
            ws_base: String::new(),
            rest_base: String::new(),
            testnet_rest_base: String::new(),
            oi_mock: true,
        }
    }

    fn manager() -> ExecutionManager {
        let manager = ExecutionManager::new(&test_config(), reqwest::Client::new());
        manager.connect_with_filters(vec![SymbolFilters {
            symbol: "BTCUSDT".to_string(),
            step_size: 0.001,
            tick_size: 0.1,
            min_notional: 5.0,
        }]);
        manager
    }

    #[test]
    fn enable_requires_connection() {
        let manager = ExecutionManager::new(&test_config(), reqwest::Client::new());
        assert!(manager.set_enabled(true).is_err());
        assert!(!manager.status().enabled);
    }

    #[test]
    fn leverage_is_clamped_to_configured_cap() {
        let manager = manager();
        let status = manager
            .update_settings(ExecutionSettings {
                leverage: 125,
                ramp: RampConfig::default(),
            })
            .unwrap();
        assert_eq!(status.settings.leverage, 20);
        assert!(manager
            .update_settings(ExecutionSettings {
                leverage: 0,
                ramp: RampConfig::default(),
            })
            .is_err());
    }

    #[test]
    fn unknown_symbol_is_rejected_while_connected() {
        let manager = manager();
        assert!(manager.set_symbol("DOGEUSDT").is_err());
        let status = manager.set_symbol("btcusdt").unwrap();
        assert_eq!(status.symbol, "BTCUSDT");
    }

    #[test]
    fn quote_uses_active_filters_and_records_last_sizing() {
        let manager = manager();
        manager.set_enabled(true).unwrap();
        manager
            .update_settings(ExecutionSettings {
                leverage: 10,
                ramp: RampConfig {
                    starting_margin: 50.0,
                    min_margin: 10.0,
                    ramp_step_pct: 10.0,
                    ramp_decay_pct: 10.0,
                    ramp_max_mult: 2.0,
                },
            })
            .unwrap();

        // Budget 50 x leverage 10 at 30k marks: 0.01666... floors to 0.016.
        let result = manager.quote(30_000.0).unwrap();
        assert!((result.quantity - 0.016).abs() < 1e-12);
        assert!((result.margin_required - 48.0).abs() < 1e-9);
        assert!(!result.is_blocked());
        assert!(manager.status().last_sizing.is_some());
    }

    #[test]
    fn losing_streak_freezes_sizing_but_not_status() {
        let manager = manager();
        manager.set_enabled(true).unwrap();

        for _ in 0..FREEZE_FAIL_STREAK {
            manager.on_trade_closed(-1.0);
        }
        let status = manager.status();
        assert!(status.frozen);
        assert!(manager.quote(30_000.0).is_err());

        // Re-arming clears the freeze.
        manager.set_enabled(true).unwrap();
        assert!(!manager.status().frozen);
        assert!(manager.quote(30_000.0).is_ok());
    }

    #[test]
    fn ramp_counters_follow_closed_trades() {
        let manager = manager();
        manager.on_trade_closed(5.0);
        manager.on_trade_closed(-2.0);
        let status = manager.status();
        assert_eq!(status.ramp.success_count, 1);
        assert_eq!(status.ramp.fail_count, 1);
    }

    #[test]
    fn exchange_info_wire_parses_filters() {
        let text = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","tickSize":"0.10","minPrice":"0.10"},
            {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001"},
            {"filterType":"MIN_NOTIONAL","notional":"100"}]}]}"#;
        let wire: ExchangeInfoWire = serde_json::from_str(text).unwrap();
        let filters = wire
            .symbols
            .into_iter()
            .map(SymbolWire::parse_filters)
            .collect::<Vec<_>>();
        assert_eq!(filters[0].symbol, "BTCUSDT");
        assert_eq!(filters[0].step_size, 0.001);
        assert_eq!(filters[0].tick_size, 0.10);
        assert_eq!(filters[0].min_notional, 100.0);
    }
}
