//! Bounded sample windows and request counters.
//!
//! Every instance keeps a short history of observed latencies and
//! tokens-per-second samples; the dispatcher keeps a longer fleet-wide
//! throughput window. All windows are fixed-capacity rings — the oldest
//! sample is evicted on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A bounded ring of `f64` samples with a running mean.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest if the window is full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the samples currently in the window; 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent sample, if any.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }
}

/// Lifetime request counters for one instance.
///
/// Updated lock-free from the dispatcher's request tasks; readers may lag
/// by a single increment, which is acceptable for status reporting.
#[derive(Debug, Default)]
pub struct RequestTotals {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    tokens: AtomicU64,
}

impl RequestTotals {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// `successes / max(1, requests)`; 1.0 when no requests have been seen.
    pub fn success_rate(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 1.0;
        }
        self.successes() as f64 / requests as f64
    }
}

/// An `f64` stored as atomic bits, for metrics written and read across tasks.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Store `value` if it exceeds the current value.
    pub fn store_max(&self, value: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        while value > f64::from_bits(current) {
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // SampleWindow
    // -----------------------------------------------------------------------

    #[test]
    fn test_window_mean_empty_is_zero() {
        let window = SampleWindow::new(10);
        assert_eq!(window.mean(), 0.0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_mean() {
        let mut window = SampleWindow::new(10);
        window.push(100.0);
        window.push(200.0);
        window.push(300.0);
        assert_eq!(window.mean(), 200.0);
        assert_eq!(window.last(), Some(300.0));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = SampleWindow::new(100);
        for i in 0..250 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 100);
        // Oldest samples were evicted: window holds 150..250.
        assert_eq!(window.mean(), (150.0 + 249.0) / 2.0);
    }

    #[test]
    fn test_window_eviction_order_is_fifo() {
        let mut window = SampleWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.mean(), 3.0); // 2, 3, 4
    }

    // -----------------------------------------------------------------------
    // RequestTotals
    // -----------------------------------------------------------------------

    #[test]
    fn test_totals_success_rate_defaults_to_one() {
        let totals = RequestTotals::default();
        assert_eq!(totals.success_rate(), 1.0);
    }

    #[test]
    fn test_totals_success_rate() {
        let totals = RequestTotals::default();
        for _ in 0..4 {
            totals.record_request();
        }
        totals.record_success();
        totals.record_success();
        totals.record_success();
        totals.record_failure();
        assert_eq!(totals.success_rate(), 0.75);
        assert!(totals.successes() + totals.failures() <= totals.requests());
    }

    #[test]
    fn test_totals_tokens_accumulate() {
        let totals = RequestTotals::default();
        totals.record_tokens(100);
        totals.record_tokens(42);
        assert_eq!(totals.tokens(), 142);
    }

    // -----------------------------------------------------------------------
    // AtomicF64
    // -----------------------------------------------------------------------

    #[test]
    fn test_atomic_f64_roundtrip() {
        let value = AtomicF64::new(1485.5);
        assert_eq!(value.load(), 1485.5);
        value.store(12.25);
        assert_eq!(value.load(), 12.25);
    }

    #[test]
    fn test_atomic_f64_store_max() {
        let peak = AtomicF64::new(100.0);
        peak.store_max(50.0);
        assert_eq!(peak.load(), 100.0);
        peak.store_max(250.0);
        assert_eq!(peak.load(), 250.0);
    }
}
