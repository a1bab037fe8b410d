//! Subscriber registry and envelope fan-out with per-subscription
//! backpressure.
//!
//! Each subscription owns a bounded FIFO of envelopes. When the queue is
//! full the oldest envelope is dropped and counted; a subscription whose
//! drop count exceeds the close threshold is terminated. Delivery iterates
//! a snapshot of the registry so subscribe/unsubscribe never re-enter the
//! fan-out loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::models::MetricsEnvelope;

/// Default bound on a subscriber's send queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Drops tolerated before a subscription is closed as a slow consumer.
pub const DEFAULT_DROP_CLOSE_THRESHOLD: u64 = 256;

/// What a subscriber receives next.
#[derive(Debug, Clone)]
pub enum Delivery {
    Envelope(Arc<MetricsEnvelope>),
    /// Terminal: the subscription was closed (slow consumer or
    /// unsubscribe). No further envelopes will arrive.
    Closed { dropped: u64 },
}

#[derive(Debug)]
pub struct Subscription {
    id: u64,
    symbols: HashSet<String>,
    queue: Mutex<VecDeque<Arc<MetricsEnvelope>>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn symbols(&self) -> &HashSet<String> {
        &self.symbols
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Await the next delivery. Returns `Delivery::Closed` exactly once
    /// after the subscription terminates.
    pub async fn recv(&self) -> Delivery {
        loop {
            if self.is_closed() {
                return Delivery::Closed {
                    dropped: self.dropped_count(),
                };
            }
            if let Some(envelope) = self.queue.lock().pop_front() {
                return Delivery::Envelope(envelope);
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct SubscriptionHub {
    registry: Mutex<HashMap<u64, Arc<Subscription>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    drop_close_threshold: u64,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_QUEUE_CAPACITY, DEFAULT_DROP_CLOSE_THRESHOLD)
    }

    pub fn with_limits(queue_capacity: usize, drop_close_threshold: u64) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            drop_close_threshold,
        }
    }

    pub fn subscribe(&self, symbols: HashSet<String>) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            symbols,
            queue: Mutex::new(VecDeque::with_capacity(self.queue_capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.registry.lock().insert(id, subscription.clone());
        debug!(id, symbols = ?subscription.symbols, "subscriber registered");
        subscription
    }

    /// Remove a subscription and release its queue synchronously.
    pub fn unsubscribe(&self, id: u64) {
        if let Some(subscription) = self.registry.lock().remove(&id) {
            subscription.queue.lock().clear();
            subscription.close();
            debug!(id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Deliver an envelope to every live subscription matching its symbol.
    pub fn publish(&self, envelope: Arc<MetricsEnvelope>) {
        let targets: Vec<Arc<Subscription>> =
            self.registry.lock().values().cloned().collect();

        for subscription in targets {
            if subscription.is_closed() || !subscription.symbols.contains(&envelope.symbol) {
                continue;
            }

            let mut overflowed = false;
            {
                let mut queue = subscription.queue.lock();
                if queue.len() >= self.queue_capacity {
                    queue.pop_front();
                    let dropped = subscription.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped > self.drop_close_threshold {
                        overflowed = true;
                    }
                }
                if !overflowed {
                    queue.push_back(envelope.clone());
                }
            }

            if overflowed {
                warn!(
                    id = subscription.id,
                    dropped = subscription.dropped_count(),
                    "closing slow subscriber"
                );
                subscription.close();
            } else {
                subscription.notify.notify_one();
            }
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}
