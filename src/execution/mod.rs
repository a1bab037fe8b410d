//! Testnet execution session: adaptive capital ramp, order sizing, and
//! session lifecycle driven by the admin surface.

pub mod ramp;
pub mod session;

pub use ramp::{RampConfig, RampState, SizingQuery, SizingRamp, SizingResult};
pub use session::{ExecutionManager, ExecutionSettings, ExecutionStatus, SymbolFilters};
