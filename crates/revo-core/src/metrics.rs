//! Global atomic counters for orchestration events.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits the current
//! values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    stages_dispatched: AtomicU64,
    retries_scheduled: AtomicU64,
    stages_degraded: AtomicU64,
    late_results_discarded: AtomicU64,
    deliveries_posted: AtomicU64,
    deliveries_deduplicated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            stages_dispatched: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            stages_degraded: AtomicU64::new(0),
            late_results_discarded: AtomicU64::new(0),
            deliveries_posted: AtomicU64::new(0),
            deliveries_deduplicated: AtomicU64::new(0),
        }
    }

    pub fn inc_stages_dispatched(&self) {
        self.stages_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stages_dispatched", "counter incremented");
    }

    pub fn inc_retries_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries_scheduled", "counter incremented");
    }

    pub fn inc_stages_degraded(&self) {
        self.stages_degraded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stages_degraded", "counter incremented");
    }

    /// A result arrived for an attempt the engine no longer waits on.
    pub fn inc_late_results_discarded(&self) {
        self.late_results_discarded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "late_results_discarded", "counter incremented");
    }

    pub fn inc_deliveries_posted(&self) {
        self.deliveries_posted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deliveries_posted", "counter incremented");
    }

    pub fn inc_deliveries_deduplicated(&self) {
        self.deliveries_deduplicated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deliveries_deduplicated", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            stages_dispatched = self.stages_dispatched(),
            retries_scheduled = self.retries_scheduled(),
            stages_degraded = self.stages_degraded(),
            late_results_discarded = self.late_results_discarded(),
            deliveries_posted = self.deliveries_posted(),
            deliveries_deduplicated = self.deliveries_deduplicated(),
        );
    }

    pub fn stages_dispatched(&self) -> u64 {
        self.stages_dispatched.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn stages_degraded(&self) -> u64 {
        self.stages_degraded.load(Ordering::Relaxed)
    }

    pub fn late_results_discarded(&self) -> u64 {
        self.late_results_discarded.load(Ordering::Relaxed)
    }

    pub fn deliveries_posted(&self) -> u64 {
        self.deliveries_posted.load(Ordering::Relaxed)
    }

    pub fn deliveries_deduplicated(&self) -> u64 {
        self.deliveries_deduplicated.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.stages_dispatched,
            &self.retries_scheduled,
            &self.stages_degraded,
            &self.late_results_discarded,
            &self.deliveries_posted,
            &self.deliveries_deduplicated,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_stages_dispatched();
        m.inc_stages_dispatched();
        m.inc_retries_scheduled();
        m.inc_deliveries_deduplicated();
        assert_eq!(m.stages_dispatched(), 2);
        assert_eq!(m.retries_scheduled(), 1);
        assert_eq!(m.deliveries_deduplicated(), 1);
        assert_eq!(m.deliveries_posted(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_stages_degraded();
        m.inc_late_results_discarded();
        m.inc_deliveries_posted();
        m.reset();
        assert_eq!(m.stages_degraded(), 0);
        assert_eq!(m.late_results_discarded(), 0);
        assert_eq!(m.deliveries_posted(), 0);
    }
}
