//! Rolling-window orderflow aggregators and the composite metric
//! calculator.

pub mod composite;
pub mod cvd;
pub mod trade_flow;
pub mod window;

pub use composite::CompositeCalculator;
pub use cvd::{CvdCalculator, CvdReading};
pub use trade_flow::TradeFlowAggregator;
pub use window::RollingWindow;

/// Denominator guard shared by the ratio-style metrics.
pub(crate) const EPS: f64 = 1e-9;
