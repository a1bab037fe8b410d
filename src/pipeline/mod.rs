//! Per-symbol pipeline state and the periodic metrics assembler.
//!
//! Every mutable component has exactly one writer (its feed task); the
//! assembler takes short per-component locks to read consistent snapshots.

pub mod assembler;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::book::BookSynchroniser;
use crate::feeds::funding::FundingTracker;
use crate::feeds::open_interest::OiTracker;
use crate::metrics::{CompositeCalculator, CvdCalculator, TradeFlowAggregator};
use crate::models::{Config, OiSourceTag, Trade};

/// All rolling state for one symbol. Each field is locked independently;
/// no component ever takes two of these locks at once.
pub struct SymbolPipeline {
    pub symbol: String,
    pub sync: Mutex<BookSynchroniser>,
    pub flow: Mutex<TradeFlowAggregator>,
    pub cvd: Mutex<CvdCalculator>,
    pub composite: Mutex<CompositeCalculator>,
    pub oi: Mutex<OiTracker>,
    pub funding: Mutex<FundingTracker>,
}

impl SymbolPipeline {
    pub fn new(symbol: &str, trade_window_secs: u64, oi_source: OiSourceTag) -> Self {
        Self {
            symbol: symbol.to_string(),
            sync: Mutex::new(BookSynchroniser::new(symbol)),
            flow: Mutex::new(TradeFlowAggregator::new(trade_window_secs)),
            cvd: Mutex::new(CvdCalculator::default()),
            composite: Mutex::new(CompositeCalculator::new()),
            oi: Mutex::new(OiTracker::new(oi_source)),
            funding: Mutex::new(FundingTracker::new()),
        }
    }

    /// Route one aggressive trade into every trade-derived aggregator.
    pub fn record_trade(&self, trade: Trade) {
        self.flow.lock().add_trade(trade);
        self.cvd.lock().on_trade(&trade);
        self.composite.lock().on_trade(&trade);
    }
}

/// Process-wide map of symbol pipelines, built once at startup.
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<SymbolPipeline>>,
}

impl PipelineRegistry {
    pub fn from_config(cfg: &Config) -> Self {
        let oi_source = if cfg.oi_mock {
            OiSourceTag::Mock
        } else {
            OiSourceTag::Real
        };
        let pipelines = cfg
            .symbols
            .iter()
            .map(|symbol| {
                (
                    symbol.clone(),
                    Arc::new(SymbolPipeline::new(symbol, cfg.trade_window_secs, oi_source)),
                )
            })
            .collect();
        Self { pipelines }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolPipeline>> {
        self.pipelines.get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.pipelines.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SymbolPipeline>> {
        self.pipelines.values()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }
}
