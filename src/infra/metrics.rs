//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::attendance::AttendanceOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Dwell time bucket boundaries (seconds)
/// Buckets: ≤5, ≤10, ≤20, ≤30, ≤45, ≤60, ≤90, ≤120, ≤180, ≤300, >300 s
const DWELL_BOUNDS: [u64; 10] = [5, 10, 20, 30, 45, 60, 90, 120, 180, 300];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn dwell_bucket_index(secs: u64) -> usize {
    DWELL_BOUNDS.partition_point(|&bound| bound < secs)
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

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
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
    /// Position fixes accepted (monotonic)
    samples_total: AtomicU64,
    /// Position acquisitions that failed or timed out (monotonic)
    sample_failures_total: AtomicU64,
    /// Fixes processed since last report (reset on report)
    ticks_since_report: AtomicU64,
    /// Sum of tick processing latencies in microseconds (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Max tick latency in microseconds (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Tick processing latency histogram buckets (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Zone entries (monotonic)
    zone_entries_total: AtomicU64,
    /// Sealed decisions by outcome (monotonic)
    auto_present_total: AtomicU64,
    manual_present_total: AtomicU64,
    manual_absent_total: AtomicU64,
    /// Dwell at decision time histogram (seconds, cumulative)
    dwell_buckets: [AtomicU64; NUM_BUCKETS],
    /// Driver commands accepted / rejected (monotonic)
    commands_total: AtomicU64,
    commands_rejected_total: AtomicU64,
    /// Store writes (monotonic)
    persist_attempts_total: AtomicU64,
    persist_retries_total: AtomicU64,
    persist_succeeded_total: AtomicU64,
    persist_exhausted_total: AtomicU64,
    persist_deduped_total: AtomicU64,
    /// Domain events dropped due to channel full (monotonic)
    events_dropped: AtomicU64,
    /// Writes dispatched and not yet acknowledged (gauge)
    pending_sync: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            sample_failures_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            zone_entries_total: AtomicU64::new(0),
            auto_present_total: AtomicU64::new(0),
            manual_present_total: AtomicU64::new(0),
            manual_absent_total: AtomicU64::new(0),
            dwell_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            commands_total: AtomicU64::new(0),
            commands_rejected_total: AtomicU64::new(0),
            persist_attempts_total: AtomicU64::new(0),
            persist_retries_total: AtomicU64::new(0),
            persist_succeeded_total: AtomicU64::new(0),
            persist_exhausted_total: AtomicU64::new(0),
            persist_deduped_total: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            pending_sync: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a fix was processed with given latency (lock-free)
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.tick_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.tick_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_sample_failure(&self) {
        self.sample_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_entry(&self) {
        self.zone_entries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sealed decision and its dwell (if the student was in the zone)
    #[inline]
    pub fn record_decision(&self, outcome: AttendanceOutcome, dwell_seconds: Option<u64>) {
        let counter = match outcome {
            AttendanceOutcome::AutoPresent => &self.auto_present_total,
            AttendanceOutcome::ManualPresent => &self.manual_present_total,
            AttendanceOutcome::ManualAbsent => &self.manual_absent_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(secs) = dwell_seconds {
            self.dwell_buckets[dwell_bucket_index(secs)].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_command(&self, accepted: bool) {
        if accepted {
            self.commands_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_rejected_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_persist_attempt(&self, attempt: u32) {
        self.persist_attempts_total.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.persist_retries_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_persist_succeeded(&self) {
        self.persist_succeeded_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_exhausted(&self) {
        self.persist_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persist_deduped(&self) {
        self.persist_deduped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a domain event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_pending_sync(&self, pending: u64) {
        self.pending_sync.store(pending, Ordering::Relaxed);
    }

    #[inline]
    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sample_failures_total(&self) -> u64 {
        self.sample_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn commands_rejected_total(&self) -> u64 {
        self.commands_rejected_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn persist_succeeded_total(&self) -> u64 {
        self.persist_succeeded_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn persist_exhausted_total(&self) -> u64 {
        self.persist_exhausted_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn persist_deduped_total(&self) -> u64 {
        self.persist_deduped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, remaining_students: usize) -> MetricsSummary {
        let ticks = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.tick_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let ticks_per_min = if elapsed.as_secs_f64() > 0.0 {
            ticks as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if ticks > 0 { latency_sum / ticks } else { 0 };

        MetricsSummary {
            samples_total: self.samples_total.load(Ordering::Relaxed),
            sample_failures_total: self.sample_failures_total.load(Ordering::Relaxed),
            ticks_per_min,
            avg_tick_latency_us: avg_latency,
            max_tick_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            zone_entries_total: self.zone_entries_total.load(Ordering::Relaxed),
            auto_present_total: self.auto_present_total.load(Ordering::Relaxed),
            manual_present_total: self.manual_present_total.load(Ordering::Relaxed),
            manual_absent_total: self.manual_absent_total.load(Ordering::Relaxed),
            dwell_buckets: load_buckets(&self.dwell_buckets),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            commands_rejected_total: self.commands_rejected_total.load(Ordering::Relaxed),
            persist_attempts_total: self.persist_attempts_total.load(Ordering::Relaxed),
            persist_retries_total: self.persist_retries_total.load(Ordering::Relaxed),
            persist_succeeded_total: self.persist_succeeded_total.load(Ordering::Relaxed),
            persist_exhausted_total: self.persist_exhausted_total.load(Ordering::Relaxed),
            persist_deduped_total: self.persist_deduped_total.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            pending_sync: self.pending_sync.load(Ordering::Relaxed),
            remaining_students,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_DWELL_BOUNDS: [u64; 10] = DWELL_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub sample_failures_total: u64,
    pub ticks_per_min: f64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    /// Tick latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub zone_entries_total: u64,
    pub auto_present_total: u64,
    pub manual_present_total: u64,
    pub manual_absent_total: u64,
    /// Dwell at decision histogram (seconds)
    /// Bounds: ≤5, ≤10, ≤20, ≤30, ≤45, ≤60, ≤90, ≤120, ≤180, ≤300, >300 s
    pub dwell_buckets: [u64; NUM_BUCKETS],
    pub commands_total: u64,
    pub commands_rejected_total: u64,
    pub persist_attempts_total: u64,
    pub persist_retries_total: u64,
    pub persist_succeeded_total: u64,
    pub persist_exhausted_total: u64,
    pub persist_deduped_total: u64,
    pub events_dropped: u64,
    pub pending_sync: u64,
    pub remaining_students: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples = %self.samples_total,
            sample_failures = %self.sample_failures_total,
            ticks_per_min = format!("{:.1}", self.ticks_per_min),
            p99_us = %self.lat_p99_us,
            auto_present = %self.auto_present_total,
            manual_present = %self.manual_present_total,
            manual_absent = %self.manual_absent_total,
            remaining = %self.remaining_students,
            pending_sync = %self.pending_sync,
            persist_exhausted = %self.persist_exhausted_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.samples_total(), 0);
        assert_eq!(metrics.events_dropped(), 0);
    }

    #[test]
    fn test_record_tick() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        assert_eq!(metrics.samples_total(), 1);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_tick(200);
        assert_eq!(metrics.samples_total(), 2);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_tick(200);
        metrics.record_tick(300);
        metrics.record_decision(AttendanceOutcome::AutoPresent, Some(25));
        metrics.record_decision(AttendanceOutcome::ManualAbsent, None);
        metrics.record_decision(AttendanceOutcome::InZone, Some(5));

        let summary = metrics.report(4);

        assert_eq!(summary.samples_total, 3);
        assert_eq!(summary.avg_tick_latency_us, 200);
        assert_eq!(summary.max_tick_latency_us, 300);
        assert_eq!(summary.auto_present_total, 1);
        assert_eq!(summary.manual_absent_total, 1);
        assert_eq!(summary.dwell_buckets[3], 1);
        assert_eq!(summary.dwell_buckets.iter().sum::<u64>(), 1);
        assert_eq!(summary.remaining_students, 4);

        // Periodic counters should be reset, monotonic ones kept
        assert_eq!(metrics.ticks_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.report(0).auto_present_total, 1);
    }

    #[test]
    fn test_persist_counters() {
        let metrics = Metrics::new();
        metrics.record_persist_attempt(1);
        metrics.record_persist_attempt(2);
        metrics.record_persist_attempt(3);
        metrics.record_persist_exhausted();
        metrics.record_command(false);

        let summary = metrics.report(0);
        assert_eq!(summary.persist_attempts_total, 3);
        assert_eq!(summary.persist_retries_total, 2);
        assert_eq!(summary.persist_exhausted_total, 1);
        assert_eq!(summary.commands_rejected_total, 1);
        assert_eq!(summary.commands_total, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_tick(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.samples_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
        assert_eq!(dwell_bucket_index(5), 0);
        assert_eq!(dwell_bucket_index(61), 6);
        assert_eq!(dwell_bucket_index(1000), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_tick(150);
        }
        let summary = metrics.report(0);
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
