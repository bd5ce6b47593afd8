//! Component I — Viewport Bus & Metrics (spec.md §4.I).
//!
//! The bus is single-writer (the producer thread), multi-reader. The
//! latest value is replaced atomically as a whole `Arc<Published>` behind
//! a `parking_lot::RwLock`, rather than pulling in a lock-free-swap
//! dependency for one call site. `subscribe()` additionally hands out a
//! `crossbeam_channel` receiver so a consumer can await new publications
//! instead of polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use viewport_types::{
    LatencyPercentiles, MatchMethod, MethodCounts, MetricsSnapshot, Published,
};

use crate::scheduler::SchedulerStats;

/// Bounded so a slow/stalled subscriber cannot hold the producer's memory
/// hostage; a full channel just drops the oldest pending publication for
/// that subscriber (spec.md §5: the producer must never block on
/// consumers).
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 8;

/// Thread-safe publication point for the latest `Published` record.
/// Readers always see a complete, internally consistent value — never a
/// half-written one — because replacement is a single pointer swap under
/// the lock (spec.md §3 invariant: "the whole record is published
/// atomically as an immutable value").
pub struct ViewportBus {
    latest: RwLock<Option<Arc<Published>>>,
    subscribers: Mutex<Vec<crossbeam_channel::Sender<Arc<Published>>>>,
    last_timestamp_ms: AtomicU64,
}

impl ViewportBus {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            last_timestamp_ms: AtomicU64::new(0),
        }
    }

    /// Publish a new record. Called only from the producer thread. Drops
    /// (rather than blocks on) a subscriber whose channel is full, per the
    /// never-block-on-consumers rule.
    pub fn publish(&self, published: Published) {
        let published = Arc::new(published);
        self.last_timestamp_ms
            .store(published.timestamp_ms.max(0) as u64, Ordering::Release);
        *self.latest.write() = Some(published.clone());

        let mut subs = self.subscribers.lock();
        subs.retain(|tx| match tx.try_send(published.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                tracing::debug!("bus subscriber lagging, dropping a publication for it");
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    /// The most recently published record, if any frame has ever been
    /// published successfully. Stale data (tracking lost since) is still
    /// returned as-is; a consumer decides based on `timestamp_ms` age
    /// whether to hide overlays (spec.md §7).
    pub fn get_latest(&self) -> Option<Arc<Published>> {
        self.latest.read().clone()
    }

    /// Hand out a receiver that yields every subsequent publication.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<Arc<Published>> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }
}

impl Default for ViewportBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling capture/match/total latency samples, reservoir-style via
/// `hdrhistogram` (already a teacher dependency in `flydra2`), feeding the
/// P50/P90/P95 snapshot fields.
struct LatencyHistograms {
    capture: hdrhistogram::Histogram<u64>,
    match_: hdrhistogram::Histogram<u64>,
    total: hdrhistogram::Histogram<u64>,
}

impl LatencyHistograms {
    fn new() -> Self {
        // 1ms to 10s range, 3 significant figures: plenty for frame-level
        // latencies while keeping memory bounded.
        let make = || hdrhistogram::Histogram::new_with_bounds(1, 10_000, 3).expect("valid histogram bounds");
        Self { capture: make(), match_: make(), total: make() }
    }

    fn percentiles(h: &hdrhistogram::Histogram<u64>) -> LatencyPercentiles {
        LatencyPercentiles {
            p50_ms: h.value_at_quantile(0.50) as f64,
            p90_ms: h.value_at_quantile(0.90) as f64,
            p95_ms: h.value_at_quantile(0.95) as f64,
        }
    }
}

/// One tick's timing breakdown, recorded into the metrics aggregator
/// regardless of whether the tick resulted in a publication.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickTiming {
    pub capture_ms: f64,
    pub match_ms: f64,
    pub total_ms: f64,
}

/// Thread-safe metrics aggregator: one producer-thread writer, any number
/// of reader threads taking consistent snapshots (spec.md §4.I).
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

struct MetricsInner {
    frames_attempted: u64,
    frames_published: u64,
    duplicates_skipped: u64,
    map_hidden: u64,
    method_counts: MethodCounts,
    latencies: LatencyHistograms,
    cascade_level_histogram: std::collections::HashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                frames_attempted: 0,
                frames_published: 0,
                duplicates_skipped: 0,
                map_hidden: 0,
                method_counts: MethodCounts::default(),
                latencies: LatencyHistograms::new(),
                cascade_level_histogram: std::collections::HashMap::new(),
            }),
        }
    }

    pub fn record_duplicate(&self) {
        let mut inner = self.inner.lock();
        inner.frames_attempted += 1;
        inner.duplicates_skipped += 1;
    }

    pub fn record_map_hidden(&self) {
        let mut inner = self.inner.lock();
        inner.frames_attempted += 1;
        inner.map_hidden += 1;
    }

    /// Record a completed tick: its method outcome (`None` for a failure
    /// that produced no `Published`, e.g. `Lost`), the cascade level used
    /// if any, and the timing breakdown.
    pub fn record_tick(&self, method: Option<MatchMethod>, level_used: Option<&str>, timing: TickTiming) {
        let mut inner = self.inner.lock();
        inner.frames_attempted += 1;

        if let Some(method) = method {
            match method {
                MatchMethod::Full => inner.method_counts.full += 1,
                MatchMethod::Roi => inner.method_counts.roi += 1,
                MatchMethod::MotionOnly => inner.method_counts.motion_only += 1,
                MatchMethod::Lost => inner.method_counts.lost += 1,
            }
            if method != MatchMethod::Lost {
                inner.frames_published += 1;
            }
        }

        if let Some(level) = level_used {
            *inner.cascade_level_histogram.entry(level.to_string()).or_insert(0) += 1;
        }

        let record = |h: &mut hdrhistogram::Histogram<u64>, ms: f64| {
            let v = ms.round().max(0.0) as u64;
            let _ = h.record(v.max(1));
        };
        record(&mut inner.latencies.capture, timing.capture_ms);
        record(&mut inner.latencies.match_, timing.match_ms);
        record(&mut inner.latencies.total, timing.total_ms);
    }

    /// Build a consistent, read-only snapshot. Safe to call from any
    /// thread at any time.
    pub fn snapshot(&self, scheduler: SchedulerStats) -> MetricsSnapshot {
        let inner = self.inner.lock();

        let tracker_prediction_rate = if inner.frames_published == 0 {
            0.0
        } else {
            inner.method_counts.motion_only as f64 / inner.frames_published as f64
        };

        let mut cascade_level_histogram: Vec<(String, u64)> =
            inner.cascade_level_histogram.iter().map(|(k, v)| (k.clone(), *v)).collect();
        cascade_level_histogram.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            frames_attempted: inner.frames_attempted,
            frames_published: inner.frames_published,
            duplicates_skipped: inner.duplicates_skipped,
            map_hidden: inner.map_hidden,
            method_counts: inner.method_counts.clone(),
            capture_latency: LatencyHistograms::percentiles(&inner.latencies.capture),
            match_latency: LatencyHistograms::percentiles(&inner.latencies.match_),
            total_latency: LatencyHistograms::percentiles(&inner.latencies.total),
            target_fps: scheduler.target_fps,
            utilization: scheduler.utilization,
            tracker_prediction_rate,
            cascade_level_histogram,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewport_types::Viewport;

    fn sample(ts: i64) -> Published {
        Published {
            viewport: Viewport::new(0.0, 0.0, 10.0, 10.0),
            confidence: 0.9,
            method: MatchMethod::Full,
            timestamp_ms: ts,
            collectibles_in_view: vec![],
        }
    }

    #[test]
    fn publish_then_get_latest_round_trips() {
        let bus = ViewportBus::new();
        assert!(bus.get_latest().is_none());
        bus.publish(sample(1000));
        let latest = bus.get_latest().expect("a publication happened");
        assert_eq!(latest.timestamp_ms, 1000);
    }

    #[test]
    fn subscriber_receives_subsequent_publications() {
        let bus = ViewportBus::new();
        let rx = bus.subscribe();
        bus.publish(sample(1000));
        bus.publish(sample(2000));
        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first.timestamp_ms, 1000);
        assert_eq!(second.timestamp_ms, 2000);
    }

    #[test]
    fn duplicate_skip_increments_without_changing_latest() {
        let bus = ViewportBus::new();
        let metrics = Metrics::new();
        bus.publish(sample(1000));
        metrics.record_duplicate();
        let stats = SchedulerStats { target_fps: 30.0, utilization: 0.5, frame_index: 1 };
        let snap = metrics.snapshot(stats);
        assert_eq!(snap.duplicates_skipped, 1);
        assert_eq!(bus.get_latest().unwrap().timestamp_ms, 1000);
    }

    #[test]
    fn method_counts_and_prediction_rate() {
        let metrics = Metrics::new();
        let timing = TickTiming { capture_ms: 1.0, match_ms: 2.0, total_ms: 3.0 };
        metrics.record_tick(Some(MatchMethod::Full), Some("fine"), timing);
        metrics.record_tick(Some(MatchMethod::MotionOnly), None, timing);
        metrics.record_tick(Some(MatchMethod::MotionOnly), None, timing);

        let stats = SchedulerStats { target_fps: 30.0, utilization: 0.5, frame_index: 3 };
        let snap = metrics.snapshot(stats);
        assert_eq!(snap.method_counts.full, 1);
        assert_eq!(snap.method_counts.motion_only, 2);
        assert!((snap.tracker_prediction_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.cascade_level_histogram, vec![("fine".to_string(), 1)]);
    }
}
