//! Admin HTTP surface and the subscriber WebSocket endpoint.

pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use crate::execution::ExecutionManager;
use crate::hub::SubscriptionHub;
use crate::logging::LoggerStats;
use crate::pipeline::PipelineRegistry;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<PipelineRegistry>,
    pub hub: Arc<SubscriptionHub>,
    pub execution: Arc<ExecutionManager>,
    pub logger: LoggerStats,
    pub started_at: Instant,
}
