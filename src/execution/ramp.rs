//! Adaptive margin-budget ramp driven by closed-trade P&L.
//!
//! Wins grow the budget by `ramp_step_pct`, losses shrink it by
//! `ramp_decay_pct`; the budget is clamped into
//! `[max(0, min_margin), starting_margin * max(1, ramp_max_mult)]` after
//! every transition.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampConfig {
    pub starting_margin: f64,
    pub min_margin: f64,
    pub ramp_step_pct: f64,
    pub ramp_decay_pct: f64,
    pub ramp_max_mult: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            starting_margin: 50.0,
            min_margin: 10.0,
            ramp_step_pct: 15.0,
            ramp_decay_pct: 30.0,
            ramp_max_mult: 4.0,
        }
    }
}

/// Published ramp state.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RampState {
    pub current_margin_budget: f64,
    pub ramp_mult: f64,
    pub success_count: u64,
    pub fail_count: u64,
}

/// Inputs for one sizing query.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingQuery {
    pub mark_price: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingResult {
    pub quantity: f64,
    pub notional: f64,
    pub margin_required: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<&'static str>,
}

impl SizingResult {
    pub fn is_blocked(&self) -> bool {
        self.blocked_reason.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SizingRamp {
    cfg: RampConfig,
    budget: f64,
    success_count: u64,
    fail_count: u64,
}

impl SizingRamp {
    pub fn new(cfg: RampConfig) -> Self {
        let mut ramp = Self {
            budget: cfg.starting_margin,
            cfg,
            success_count: 0,
            fail_count: 0,
        };
        ramp.budget = ramp.clamp(ramp.budget);
        ramp
    }

    fn bounds(&self) -> (f64, f64) {
        let min = self.cfg.min_margin.max(0.0);
        let max = min.max(self.cfg.starting_margin * self.cfg.ramp_max_mult.max(1.0));
        (min, max)
    }

    fn clamp(&self, budget: f64) -> f64 {
        let (min, max) = self.bounds();
        budget.clamp(min, max)
    }

    /// Apply one closed trade's realised P&L.
    pub fn on_trade_closed(&mut self, pnl: f64) {
        if pnl > 0.0 {
            self.success_count += 1;
            self.budget = self.clamp(self.budget * (1.0 + self.cfg.ramp_step_pct / 100.0));
        } else {
            self.fail_count += 1;
            self.budget = self.clamp(self.budget * (1.0 - self.cfg.ramp_decay_pct / 100.0));
        }
    }

    /// Swap the configuration, keeping counters and re-clamping the budget
    /// into the new bounds.
    pub fn reconfigure(&mut self, cfg: RampConfig) {
        self.cfg = cfg;
        self.budget = self.clamp(self.budget);
    }

    pub fn config(&self) -> &RampConfig {
        &self.cfg
    }

    pub fn state(&self) -> RampState {
        RampState {
            current_margin_budget: self.budget,
            ramp_mult: if self.cfg.starting_margin <= 0.0 {
                0.0
            } else {
                self.budget / self.cfg.starting_margin
            },
            success_count: self.success_count,
            fail_count: self.fail_count,
        }
    }

    /// Size an order from the current budget and the symbol's filters.
    pub fn size_order(&self, query: &SizingQuery) -> SizingResult {
        let leverage = query.leverage.max(1) as f64;
        let target_notional = self.budget * query.leverage as f64;
        let raw_qty = if query.mark_price > 0.0 {
            target_notional / query.mark_price
        } else {
            0.0
        };
        let quantity = if query.step_size > 0.0 {
            (raw_qty / query.step_size).floor() * query.step_size
        } else {
            raw_qty
        };
        let notional = quantity * query.mark_price;

        let blocked_reason =
            (quantity <= 0.0 || notional < query.min_notional).then_some("min_notional");

        SizingResult {
            quantity,
            notional,
            margin_required: notional / leverage,
            blocked_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(starting: f64, min: f64, step: f64, decay: f64, max_mult: f64) -> RampConfig {
        RampConfig {
            starting_margin: starting,
            min_margin: min,
            ramp_step_pct: step,
            ramp_decay_pct: decay,
            ramp_max_mult: max_mult,
        }
    }

    #[test]
    fn wins_ramp_up_to_the_cap_and_losses_decay() {
        let mut ramp = SizingRamp::new(cfg(100.0, 10.0, 50.0, 50.0, 3.0));

        ramp.on_trade_closed(5.0);
        assert_eq!(ramp.state().current_margin_budget, 150.0);
        ramp.on_trade_closed(5.0);
        assert_eq!(ramp.state().current_margin_budget, 225.0);
        // Third win clamps at starting * max_mult.
        ramp.on_trade_closed(5.0);
        assert_eq!(ramp.state().current_margin_budget, 300.0);

        ramp.on_trade_closed(-5.0);
        assert_eq!(ramp.state().current_margin_budget, 150.0);
        assert_eq!(ramp.state().success_count, 3);
        assert_eq!(ramp.state().fail_count, 1);
    }

    #[test]
    fn budget_stays_in_bounds_for_any_outcome_sequence() {
        let cfg = cfg(100.0, 10.0, 37.0, 61.0, 3.0);
        let mut ramp = SizingRamp::new(cfg.clone());
        let (min, max) = (10.0, 300.0);

        // Deterministic pseudo-random win/loss stream.
        let mut seed = 0x2545_f491u64;
        for _ in 0..1_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pnl = if seed & 1 == 0 { 1.0 } else { -1.0 };
            ramp.on_trade_closed(pnl);
            let budget = ramp.state().current_margin_budget;
            assert!(budget >= min && budget <= max, "budget {budget} out of bounds");
        }
    }

    #[test]
    fn zero_pnl_counts_as_a_loss() {
        let mut ramp = SizingRamp::new(cfg(100.0, 0.0, 10.0, 10.0, 2.0));
        ramp.on_trade_closed(0.0);
        assert_eq!(ramp.state().fail_count, 1);
        assert_eq!(ramp.state().current_margin_budget, 90.0);
    }

    #[test]
    fn ramp_mult_tracks_budget_over_starting() {
        let mut ramp = SizingRamp::new(cfg(100.0, 10.0, 50.0, 50.0, 2.0));
        ramp.on_trade_closed(1.0);
        assert!((ramp.state().ramp_mult - 1.5).abs() < 1e-12);

        let degenerate = SizingRamp::new(cfg(0.0, 0.0, 10.0, 10.0, 2.0));
        assert_eq!(degenerate.state().ramp_mult, 0.0);
    }

    #[test]
    fn sizing_rounds_down_to_step() {
        let ramp = SizingRamp::new(cfg(100.0, 10.0, 10.0, 10.0, 2.0));
        let result = ramp.size_order(&SizingQuery {
            mark_price: 30_000.0,
            step_size: 0.001,
            min_notional: 5.0,
            leverage: 10,
        });
        assert!(!result.is_blocked());
        assert!((result.quantity - 0.033).abs() < 1e-12);
        assert!((result.notional - 990.0).abs() < 1e-9);
        assert!((result.margin_required - 99.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_blocks_below_min_notional() {
        let ramp = SizingRamp::new(cfg(100.0, 10.0, 10.0, 10.0, 2.0));
        let result = ramp.size_order(&SizingQuery {
            mark_price: 30_000.0,
            step_size: 0.001,
            min_notional: 1_000.0,
            leverage: 10,
        });
        assert_eq!(result.blocked_reason, Some("min_notional"));
    }

    #[test]
    fn sizing_blocks_when_quantity_rounds_to_zero() {
        let ramp = SizingRamp::new(cfg(1.0, 0.0, 10.0, 10.0, 1.0));
        let result = ramp.size_order(&SizingQuery {
            mark_price: 100_000.0,
            step_size: 0.001,
            min_notional: 5.0,
            leverage: 1,
        });
        assert_eq!(result.quantity, 0.0);
        assert_eq!(result.blocked_reason, Some("min_notional"));
    }

    #[test]
    fn reconfigure_reclamps_budget() {
        let mut ramp = SizingRamp::new(cfg(100.0, 10.0, 50.0, 50.0, 4.0));
        for _ in 0..4 {
            ramp.on_trade_closed(1.0);
        }
        assert!(ramp.state().current_margin_budget > 200.0);

        ramp.reconfigure(cfg(100.0, 10.0, 50.0, 50.0, 2.0));
        assert_eq!(ramp.state().current_margin_budget, 200.0);
        assert_eq!(ramp.state().success_count, 4);
    }
}
