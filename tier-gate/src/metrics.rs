use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Gauge;
use opentelemetry::metrics::Histogram;
use quanta::Clock;
use quanta::Instant;

#[derive(Clone, Debug)]
struct Instruments {
    allowed: Counter<u64>,
    denied: Counter<u64>,
    degraded: Counter<u64>,
    cache_hits: Counter<u64>,
    cache_misses: Counter<u64>,
    enqueued: Counter<u64>,
    dead_lettered: Counter<u64>,
    queue_depth: Gauge<u64>,
    dead_letter_depth: Gauge<u64>,
    latency: Histogram<f64>,
}

#[derive(Debug, Default)]
struct Tallies {
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    enqueued: AtomicU64,
    dead_lettered: AtomicU64,
    last_queue_depth: AtomicU64,
    last_dead_letter_depth: AtomicU64,
}

/// Admission counters, exported through OpenTelemetry and kept locally for
/// [`crate::Gate::report`].
///
/// Clones share the same tallies.
#[derive(Clone, Debug)]
pub struct GateMetrics {
    instruments: Instruments,
    tallies: Arc<Tallies>,
    clock: Clock,
}

/// Point-in-time copy of the local tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub degraded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub enqueued: u64,
    pub dead_lettered: u64,
    /// Queue depth as last observed by an enqueue.
    pub last_queue_depth: u64,
    /// Dead-letter depth as last observed by a dead-lettering.
    pub last_dead_letter_depth: u64,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that were hits, or `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GateMetrics {
    pub fn new() -> Self {
        let meter = global::meter("tier_gate");
        let instruments = Instruments {
            allowed: meter.u64_counter("gate.requests.allowed").build(),
            denied: meter.u64_counter("gate.requests.denied").build(),
            degraded: meter.u64_counter("gate.store.degraded").build(),
            cache_hits: meter.u64_counter("gate.cache.hits").build(),
            cache_misses: meter.u64_counter("gate.cache.misses").build(),
            enqueued: meter.u64_counter("gate.queue.enqueued").build(),
            dead_lettered: meter.u64_counter("gate.queue.dead_lettered").build(),
            queue_depth: meter.u64_gauge("gate.queue.depth").build(),
            dead_letter_depth: meter.u64_gauge("gate.queue.dead_letter_depth").build(),
            latency: meter
                .f64_histogram("gate.admission.latency")
                .with_unit("ms")
                .build(),
        };

        Self {
            instruments,
            tallies: Arc::new(Tallies::default()),
            clock: Clock::new(),
        }
    }

    pub fn allowed(&self, tier: &str) {
        self.tallies.allowed.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .allowed
            .add(1, &[KeyValue::new("tier", tier.to_string())]);
    }

    pub fn denied(&self, tier: &str) {
        self.tallies.denied.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .denied
            .add(1, &[KeyValue::new("tier", tier.to_string())]);
    }

    /// A component went ahead without the store's answer.
    pub fn degraded(&self, component: &'static str) {
        self.tallies.degraded.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .degraded
            .add(1, &[KeyValue::new("component", component)]);
    }

    pub fn cache_hit(&self) {
        self.tallies.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.instruments.cache_hits.add(1, &[]);
    }

    pub fn cache_miss(&self) {
        self.tallies.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.instruments.cache_misses.add(1, &[]);
    }

    pub fn enqueued(&self, queue: &str) {
        self.tallies.enqueued.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .enqueued
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn dead_lettered(&self, queue: &str) {
        self.tallies.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.instruments
            .dead_lettered
            .add(1, &[KeyValue::new("queue", queue.to_string())]);
    }

    /// Ready plus in-flight items in `queue`.
    pub fn queue_depth(&self, queue: &str, depth: u64) {
        self.tallies.last_queue_depth.store(depth, Ordering::Relaxed);
        self.instruments
            .queue_depth
            .record(depth, &[KeyValue::new("queue", queue.to_string())]);
    }

    pub fn dead_letter_depth(&self, queue: &str, depth: u64) {
        self.tallies
            .last_dead_letter_depth
            .store(depth, Ordering::Relaxed);
        self.instruments
            .dead_letter_depth
            .record(depth, &[KeyValue::new("queue", queue.to_string())]);
    }

    /// Marks the start of an admission, for [`Self::record_latency`].
    pub fn start(&self) -> Instant {
        self.clock.now()
    }

    pub fn record_latency(&self, start: Instant) {
        let elapsed = self.clock.now().duration_since(start);
        self.instruments
            .latency
            .record(elapsed.as_secs_f64() * 1_000.0, &[]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.tallies;
        MetricsSnapshot {
            allowed: t.allowed.load(Ordering::Relaxed),
            denied: t.denied.load(Ordering::Relaxed),
            degraded: t.degraded.load(Ordering::Relaxed),
            cache_hits: t.cache_hits.load(Ordering::Relaxed),
            cache_misses: t.cache_misses.load(Ordering::Relaxed),
            enqueued: t.enqueued.load(Ordering::Relaxed),
            dead_lettered: t.dead_lettered.load(Ordering::Relaxed),
            last_queue_depth: t.last_queue_depth.load(Ordering::Relaxed),
            last_dead_letter_depth: t.last_dead_letter_depth.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_tallies() {
        let metrics = GateMetrics::new();
        let other = metrics.clone();

        metrics.allowed("free");
        other.denied("free");
        other.cache_hit();
        metrics.cache_miss();
        metrics.cache_miss();
        metrics.record_latency(metrics.start());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.denied, 1);
        assert_eq!(snapshot.hit_ratio(), Some(1.0 / 3.0));
    }

    #[test]
    fn depth_gauges_keep_the_latest_reading() {
        let metrics = GateMetrics::new();
        metrics.queue_depth("emails", 3);
        metrics.queue_depth("emails", 2);
        metrics.dead_letter_depth("emails", 1);

        let snapshot = metrics.clone().snapshot();
        assert_eq!(snapshot.last_queue_depth, 2);
        assert_eq!(snapshot.last_dead_letter_depth, 1);
    }

    #[test]
    fn hit_ratio_is_undefined_without_lookups() {
        assert_eq!(MetricsSnapshot::default().hit_ratio(), None);
    }
}
