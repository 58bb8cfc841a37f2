//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not be used for coordination.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Feed snapshots reconciled (monotonic)
    snapshots_total: AtomicU64,
    /// Snapshots since last report (reset on report)
    snapshots_since_report: AtomicU64,
    /// Junction records delivered to subscribers (monotonic)
    records_total: AtomicU64,
    /// Feed entries skipped as malformed (monotonic)
    malformed_total: AtomicU64,
    /// Records rejected as older than the stored one (monotonic)
    stale_total: AtomicU64,
    /// Emergency notifications raised (monotonic)
    emergencies_total: AtomicU64,
    /// Feed errors, including failed opens (monotonic)
    feed_errors_total: AtomicU64,
    /// Reconcile + fan-out latency sum in microseconds (reset on report)
    reconcile_latency_sum_us: AtomicU64,
    /// Max reconcile latency in microseconds (reset on report)
    reconcile_latency_max_us: AtomicU64,
    /// Reconcile latency histogram buckets (reset on report)
    reconcile_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Current subscriber count
    subscribers: AtomicU64,
    /// Current junctions in the reconciled store
    junctions: AtomicU64,
    enrichment_success_total: AtomicU64,
    enrichment_failed_total: AtomicU64,
    enrichment_timeout_total: AtomicU64,
    /// Enrichment latency sum in ms for successful requests (reset on report)
    enrichment_latency_sum_ms: AtomicU64,
    /// Successful enrichment requests since last report (reset on report)
    enrichment_since_report: AtomicU64,
    /// Egress messages dropped due to channel full (monotonic)
    egress_dropped_total: AtomicU64,
    /// History records written (monotonic)
    history_written_total: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            snapshots_total: AtomicU64::new(0),
            snapshots_since_report: AtomicU64::new(0),
            records_total: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            stale_total: AtomicU64::new(0),
            emergencies_total: AtomicU64::new(0),
            feed_errors_total: AtomicU64::new(0),
            reconcile_latency_sum_us: AtomicU64::new(0),
            reconcile_latency_max_us: AtomicU64::new(0),
            reconcile_latency_buckets: Default::default(),
            subscribers: AtomicU64::new(0),
            junctions: AtomicU64::new(0),
            enrichment_success_total: AtomicU64::new(0),
            enrichment_failed_total: AtomicU64::new(0),
            enrichment_timeout_total: AtomicU64::new(0),
            enrichment_latency_sum_ms: AtomicU64::new(0),
            enrichment_since_report: AtomicU64::new(0),
            egress_dropped_total: AtomicU64::new(0),
            history_written_total: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record one reconciled snapshot
    #[inline]
    pub fn record_snapshot(&self, latency_us: u64, records: u64, stale: u64) {
        self.snapshots_total.fetch_add(1, Ordering::Relaxed);
        self.snapshots_since_report.fetch_add(1, Ordering::Relaxed);
        self.records_total.fetch_add(records, Ordering::Relaxed);
        self.stale_total.fetch_add(stale, Ordering::Relaxed);
        self.reconcile_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.reconcile_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.reconcile_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_malformed(&self, count: u64) {
        self.malformed_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emergency(&self) {
        self.emergencies_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_feed_error(&self) {
        self.feed_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_subscribers(&self, count: u64) {
        self.subscribers.store(count, Ordering::Relaxed);
    }

    pub fn set_junctions(&self, count: u64) {
        self.junctions.store(count, Ordering::Relaxed);
    }

    pub fn record_enrichment_success(&self, latency_ms: u64) {
        self.enrichment_success_total.fetch_add(1, Ordering::Relaxed);
        self.enrichment_since_report.fetch_add(1, Ordering::Relaxed);
        self.enrichment_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_enrichment_failure(&self, timed_out: bool) {
        self.enrichment_failed_total.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.enrichment_timeout_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_history_written(&self) {
        self.history_written_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshots_total(&self) -> u64 {
        self.snapshots_total.load(Ordering::Relaxed)
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed_total.load(Ordering::Relaxed)
    }

    pub fn stale_total(&self) -> u64 {
        self.stale_total.load(Ordering::Relaxed)
    }

    pub fn emergencies_total(&self) -> u64 {
        self.emergencies_total.load(Ordering::Relaxed)
    }

    pub fn feed_errors_total(&self) -> u64 {
        self.feed_errors_total.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> u64 {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn junctions(&self) -> u64 {
        self.junctions.load(Ordering::Relaxed)
    }

    pub fn enrichment_success_total(&self) -> u64 {
        self.enrichment_success_total.load(Ordering::Relaxed)
    }

    pub fn enrichment_failed_total(&self) -> u64 {
        self.enrichment_failed_total.load(Ordering::Relaxed)
    }

    pub fn enrichment_timeout_total(&self) -> u64 {
        self.enrichment_timeout_total.load(Ordering::Relaxed)
    }

    pub fn egress_dropped_total(&self) -> u64 {
        self.egress_dropped_total.load(Ordering::Relaxed)
    }

    pub fn history_written_total(&self) -> u64 {
        self.history_written_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters.
    pub fn report(&self) -> MetricsSummary {
        let snapshots_count = self.snapshots_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.reconcile_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.reconcile_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.reconcile_latency_buckets);
        let enrichment_count = self.enrichment_since_report.swap(0, Ordering::Relaxed);
        let enrichment_latency_sum = self.enrichment_latency_sum_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summarize(
            Periodic {
                snapshots_count,
                latency_sum,
                max_latency,
                lat_buckets,
                enrichment_count,
                enrichment_latency_sum,
            },
            elapsed,
        )
    }

    /// Summary of the current reporting period without resetting it
    pub fn peek(&self) -> MetricsSummary {
        let periodic = Periodic {
            snapshots_count: self.snapshots_since_report.load(Ordering::Relaxed),
            latency_sum: self.reconcile_latency_sum_us.load(Ordering::Relaxed),
            max_latency: self.reconcile_latency_max_us.load(Ordering::Relaxed),
            lat_buckets: load_buckets(&self.reconcile_latency_buckets),
            enrichment_count: self.enrichment_since_report.load(Ordering::Relaxed),
            enrichment_latency_sum: self.enrichment_latency_sum_ms.load(Ordering::Relaxed),
        };
        let elapsed = self.last_report_time.lock().elapsed();
        self.summarize(periodic, elapsed)
    }

    fn summarize(&self, periodic: Periodic, elapsed: std::time::Duration) -> MetricsSummary {
        let Periodic {
            snapshots_count,
            latency_sum,
            max_latency,
            lat_buckets,
            enrichment_count,
            enrichment_latency_sum,
        } = periodic;

        let snapshots_per_sec = if elapsed.as_secs_f64() > 0.0 {
            snapshots_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            snapshots_total: self.snapshots_total(),
            snapshots_per_sec,
            records_total: self.records_total(),
            malformed_total: self.malformed_total(),
            stale_total: self.stale_total(),
            emergencies_total: self.emergencies_total(),
            feed_errors_total: self.feed_errors_total(),
            avg_reconcile_latency_us: if snapshots_count > 0 { latency_sum / snapshots_count } else { 0 },
            max_reconcile_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            subscribers: self.subscribers(),
            junctions: self.junctions(),
            enrichment_success_total: self.enrichment_success_total(),
            enrichment_failed_total: self.enrichment_failed_total(),
            enrichment_timeout_total: self.enrichment_timeout_total(),
            enrichment_avg_latency_ms: if enrichment_count > 0 {
                enrichment_latency_sum / enrichment_count
            } else {
                0
            },
            egress_dropped_total: self.egress_dropped_total(),
            history_written_total: self.history_written_total(),
        }
    }
}

/// Period counters taken either by swap or by load
struct Periodic {
    snapshots_count: u64,
    latency_sum: u64,
    max_latency: u64,
    lat_buckets: [u64; NUM_BUCKETS],
    enrichment_count: u64,
    enrichment_latency_sum: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub snapshots_total: u64,
    pub snapshots_per_sec: f64,
    pub records_total: u64,
    pub malformed_total: u64,
    pub stale_total: u64,
    pub emergencies_total: u64,
    pub feed_errors_total: u64,
    pub avg_reconcile_latency_us: u64,
    pub max_reconcile_latency_us: u64,
    /// Reconcile latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub subscribers: u64,
    pub junctions: u64,
    pub enrichment_success_total: u64,
    pub enrichment_failed_total: u64,
    pub enrichment_timeout_total: u64,
    pub enrichment_avg_latency_ms: u64,
    pub egress_dropped_total: u64,
    pub history_written_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            snapshots_total = %self.snapshots_total,
            snapshots_per_sec = format!("{:.2}", self.snapshots_per_sec),
            junctions = %self.junctions,
            subscribers = %self.subscribers,
            avg_latency_us = %self.avg_reconcile_latency_us,
            max_latency_us = %self.max_reconcile_latency_us,
            p99_us = %self.lat_p99_us,
            malformed = %self.malformed_total,
            stale = %self.stale_total,
            emergencies = %self.emergencies_total,
            feed_errors = %self.feed_errors_total,
            enrichment_ok = %self.enrichment_success_total,
            enrichment_failed = %self.enrichment_failed_total,
            enrichment_avg_ms = %self.enrichment_avg_latency_ms,
            egress_dropped = %self.egress_dropped_total,
            "metrics"
        );
    }
}
