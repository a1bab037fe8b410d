//! Periodic per-symbol envelope assembly.
//!
//! One task per symbol ticks at the publication cadence, reads a consistent
//! snapshot from every collaborator without mutating book or aggregator
//! state, and hands the envelope to the hub. While the book resynchronises
//! the envelope is tagged `STALE` and its levels are elided; metric scalars
//! keep publishing.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::info;

use crate::hub::SubscriptionHub;
use crate::models::{now_ms, BookStateTag, CvdBlock, CvdFrame, MetricsEnvelope};

use super::SymbolPipeline;

/// Levels per side published in an envelope.
const ENVELOPE_DEPTH: usize = 8;
/// Cadence of the composite history sampler.
const SAMPLE_INTERVAL_MS: i64 = 1_000;

/// Build one envelope from the pipeline's current state.
pub fn build_envelope(pipeline: &SymbolPipeline, canonical_time_ms: i64) -> MetricsEnvelope {
    // Book first: state tag, levels and the volumes the composite needs,
    // all under a single short lock so no partially-applied diff is seen.
    let (state, view, bids, asks) = {
        let sync = pipeline.sync.lock();
        let view = sync.book().view();
        if sync.is_synced() {
            let (bids, asks) = sync.book().top_levels(ENVELOPE_DEPTH);
            (BookStateTag::Live, view, bids, asks)
        } else {
            (BookStateTag::Stale, view, Vec::new(), Vec::new())
        }
    };

    let time_and_sales = pipeline.flow.lock().summary();

    let cvd = {
        let mut calc = pipeline.cvd.lock();
        let readings = calc.read(canonical_time_ms);
        let frame = |label: &str| {
            readings
                .iter()
                .find(|r| r.label == label)
                .map(|r| CvdFrame {
                    cvd: r.cvd,
                    delta: r.delta,
                    warm_up_pct: r.warm_up_pct,
                })
                .unwrap_or(CvdFrame {
                    cvd: 0.0,
                    delta: 0.0,
                    warm_up_pct: 0.0,
                })
        };
        CvdBlock {
            tf1m: frame("tf1m"),
            tf5m: frame("tf5m"),
            tf15m: frame("tf15m"),
        }
    };

    let legacy_metrics = pipeline.composite.lock().snapshot(&view);
    let open_interest = pipeline.oi.lock().block();
    let funding = pipeline.funding.lock().block(canonical_time_ms);

    MetricsEnvelope {
        kind: "metrics",
        symbol: pipeline.symbol.clone(),
        canonical_time_ms,
        state,
        price: view.mid_price(),
        bids,
        asks,
        time_and_sales,
        cvd,
        open_interest,
        funding,
        absorption: None,
        legacy_metrics,
    }
}

/// Spawn the periodic assembler for one symbol.
pub fn spawn_assembler(
    pipeline: Arc<SymbolPipeline>,
    hub: Arc<SubscriptionHub>,
    tick_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(tick_ms.max(10)));
        // A slow tick must not burst later; each tick is one unit of work.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sample_ms = 0i64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(symbol = %pipeline.symbol, "assembler stopped");
                        return;
                    }
                    continue;
                }
            }

            let now = now_ms();
            if now - last_sample_ms >= SAMPLE_INTERVAL_MS {
                pipeline.composite.lock().sample();
                last_sample_ms = now;
            }

            let envelope = build_envelope(&pipeline, now);
            hub.publish(Arc::new(envelope));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Snapshot;
    use crate::models::{now_ms, OiSourceTag, Side, Trade};

    fn pipeline() -> SymbolPipeline {
        SymbolPipeline::new("BTCUSDT", 60, OiSourceTag::Real)
    }

    fn seed_book(pipeline: &SymbolPipeline) {
        pipeline.sync.lock().apply_snapshot(&Snapshot {
            last_update_id: 10,
            bids: vec![(100.0, 10.0), (99.0, 5.0)],
            asks: vec![(101.0, 7.0), (102.0, 3.0)],
        });
    }

    #[test]
    fn live_envelope_carries_levels_and_metrics() {
        let p = pipeline();
        seed_book(&p);
        let now = now_ms();
        p.record_trade(Trade {
            price: 100.5,
            quantity: 2.0,
            side: Side::Buy,
            timestamp_ms: now,
            arrival_ms: now,
        });

        let env = build_envelope(&p, now);
        assert_eq!(env.state, BookStateTag::Live);
        assert_eq!(env.price, 100.5);
        assert_eq!(env.bids[0], [100.0, 10.0, 10.0]);
        assert_eq!(env.asks.len(), 2);
        assert_eq!(env.time_and_sales.trade_count, 1);
        assert_eq!(env.cvd.tf1m.cvd, 2.0);
        assert_eq!(env.legacy_metrics.cvd_session, 2.0);
        assert!(env.absorption.is_none());
    }

    #[test]
    fn stale_envelope_elides_levels_but_keeps_scalars() {
        let p = pipeline();
        seed_book(&p);
        let now = now_ms();
        p.record_trade(Trade {
            price: 100.0,
            quantity: 3.0,
            side: Side::Sell,
            timestamp_ms: now,
            arrival_ms: now,
        });

        // Force a gap: the synchroniser flips to Resync.
        let gap = crate::book::Diff {
            first_update_id: 100,
            last_update_id: 110,
            bids: vec![],
            asks: vec![],
            event_time_ms: now,
        };
        assert_eq!(
            p.sync.lock().apply_diff(&gap),
            crate::book::DiffOutcome::Gap
        );

        let env = build_envelope(&p, now);
        assert_eq!(env.state, BookStateTag::Stale);
        assert!(env.bids.is_empty());
        assert!(env.asks.is_empty());
        // Trade-derived metrics keep flowing.
        assert_eq!(env.time_and_sales.trade_count, 1);
        assert_eq!(env.cvd.tf1m.cvd, -3.0);
    }

    #[test]
    fn aggregators_survive_snapshot_replacement() {
        let p = pipeline();
        seed_book(&p);
        let now = now_ms();
        p.record_trade(Trade {
            price: 100.0,
            quantity: 1.0,
            side: Side::Buy,
            timestamp_ms: now,
            arrival_ms: now,
        });

        // Hard book replacement, as after a reconnect.
        p.sync.lock().apply_snapshot(&Snapshot {
            last_update_id: 30,
            bids: vec![(200.0, 1.0)],
            asks: vec![(201.0, 1.0)],
        });

        let env = build_envelope(&p, now);
        assert_eq!(env.time_and_sales.aggressive_buy_volume, 1.0);
        assert_eq!(env.cvd.tf1m.cvd, 1.0);
        assert_eq!(env.legacy_metrics.cvd_session, 1.0);
        assert_eq!(env.bids[0][0], 200.0);
    }

    #[test]
    fn canonical_time_is_monotonic_across_builds() {
        let p = pipeline();
        seed_book(&p);
        let e1 = build_envelope(&p, 1_000);
        let e2 = build_envelope(&p, 1_250);
        assert!(e2.canonical_time_ms >= e1.canonical_time_ms);
    }
}
