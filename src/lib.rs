//! FlowBot Backend
//!
//! Real-time orderflow telemetry for crypto futures: per-symbol depth
//! synchronisation, rolling-window orderflow metrics, WebSocket fan-out to
//! dashboard subscribers, and a single testnet execution session sized by an
//! adaptive capital ramp.

pub mod api;
pub mod book;
pub mod execution;
pub mod feeds;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
