//! Utility helpers shared by the evaluators and the HTTP surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Trim surrounding whitespace and lower-case an address for comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Fixed histogram bucket upper bounds in ms (inclusive style for counting).
pub const LATENCY_BUCKETS_MS: &[u64] = &[1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000];

/// Lock-free latency histogram with fixed buckets, exposed in Prometheus
/// text format by the `/metrics` handler.
pub struct LatencyHistogram {
    buckets: &'static [u64],
    counts: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(buckets: &'static [u64]) -> Self {
        Self {
            buckets,
            counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, ms: u64) {
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in self.buckets.iter().enumerate() {
            if ms <= *ub {
                self.counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }

    /// Cumulative `(upper_bound, count)` pairs, excluding the `+Inf` bucket.
    pub fn cumulative(&self) -> Vec<(u64, u64)> {
        let mut cumulative = 0u64;
        self.buckets
            .iter()
            .zip(self.counts.iter())
            .map(|(ub, c)| {
                cumulative += c.load(Ordering::Relaxed);
                (*ub, cumulative)
            })
            .collect()
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(LATENCY_BUCKETS_MS)
    }
}
