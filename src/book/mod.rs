//! Per-symbol L2 order book state and the snapshot+diff synchroniser.

pub mod state;
pub mod sync;

pub use state::{BookView, OrderBook};
pub use sync::{BookSynchroniser, Diff, DiffOutcome, Snapshot, SyncState};
