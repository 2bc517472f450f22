//! Lifecycle Metrics
//!
//! Thread-safe counters for evaluation and execution cycles, plus an
//! in-flight gauge with its high-water mark.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Thread-safe metrics shared by the evaluator and the executor
#[derive(Debug, Clone, Default)]
pub struct LifecycleMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Completed evaluation cycles
    evaluation_cycles: AtomicUsize,
    /// Eligible decisions recorded
    eligible_decisions: AtomicUsize,
    /// Ineligible decisions recorded
    ineligible_decisions: AtomicUsize,
    /// Targets selected by more than one eligible policy
    overlaps_detected: AtomicUsize,
    /// Completed execution cycles
    execution_cycles: AtomicUsize,
    /// Queue entries claimed for execution
    operations_dispatched: AtomicUsize,
    operations_succeeded: AtomicUsize,
    operations_with_warnings: AtomicUsize,
    operations_retried: AtomicUsize,
    operations_failed: AtomicUsize,
    /// Candidates passed over (target busy, limits reached)
    operations_skipped: AtomicUsize,
    /// Total bytes reclaimed by successful actions
    bytes_reclaimed: AtomicU64,
    /// Total driver time in milliseconds
    total_duration_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_evaluation_cycle(&self, eligible: usize, ineligible: usize, overlaps: usize) {
        self.inner.evaluation_cycles.fetch_add(1, Ordering::Relaxed);
        self.inner
            .eligible_decisions
            .fetch_add(eligible, Ordering::Relaxed);
        self.inner
            .ineligible_decisions
            .fetch_add(ineligible, Ordering::Relaxed);
        self.inner
            .overlaps_detected
            .fetch_add(overlaps, Ordering::Relaxed);
    }

    pub fn record_execution_cycle(&self) {
        self.inner.execution_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: usize) {
        self.inner
            .operations_skipped
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Mark an operation as started. Returns the in-flight count including it.
    pub fn operation_started(&self) -> usize {
        self.inner
            .operations_dispatched
            .fetch_add(1, Ordering::Relaxed);
        let current = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peak_in_flight
            .fetch_max(current, Ordering::SeqCst);
        current
    }

    pub fn operation_finished(&self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_success(&self, bytes_reclaimed: u64, duration_ms: u64) {
        self.inner
            .operations_succeeded
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_reclaimed
            .fetch_add(bytes_reclaimed, Ordering::Relaxed);
        self.record_duration_ms(duration_ms);
    }

    pub fn record_warning(&self) {
        self.inner
            .operations_with_warnings
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.operations_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration_ms(&self, duration_ms: u64) {
        self.inner
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn evaluation_cycles(&self) -> usize {
        self.inner.evaluation_cycles.load(Ordering::Relaxed)
    }

    pub fn eligible_decisions(&self) -> usize {
        self.inner.eligible_decisions.load(Ordering::Relaxed)
    }

    pub fn ineligible_decisions(&self) -> usize {
        self.inner.ineligible_decisions.load(Ordering::Relaxed)
    }

    pub fn overlaps_detected(&self) -> usize {
        self.inner.overlaps_detected.load(Ordering::Relaxed)
    }

    pub fn execution_cycles(&self) -> usize {
        self.inner.execution_cycles.load(Ordering::Relaxed)
    }

    pub fn operations_dispatched(&self) -> usize {
        self.inner.operations_dispatched.load(Ordering::Relaxed)
    }

    pub fn operations_succeeded(&self) -> usize {
        self.inner.operations_succeeded.load(Ordering::Relaxed)
    }

    pub fn operations_with_warnings(&self) -> usize {
        self.inner.operations_with_warnings.load(Ordering::Relaxed)
    }

    pub fn operations_retried(&self) -> usize {
        self.inner.operations_retried.load(Ordering::Relaxed)
    }

    pub fn operations_failed(&self) -> usize {
        self.inner.operations_failed.load(Ordering::Relaxed)
    }

    pub fn operations_skipped(&self) -> usize {
        self.inner.operations_skipped.load(Ordering::Relaxed)
    }

    pub fn bytes_reclaimed(&self) -> u64 {
        self.inner.bytes_reclaimed.load(Ordering::Relaxed)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.inner.total_duration_ms.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running operations observed.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }
}
