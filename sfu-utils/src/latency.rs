//! Windowed latency aggregation.
//!
//! Samples land in per-interval buckets, each a running Welford
//! accumulator, over a bounded sliding window. Summaries merge buckets so
//! both the whole window and just the most recent stretch can be read.

use std::collections::VecDeque;
use std::time::Duration;

/// Running mean/variance accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Welford {
    count: f64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn update(&mut self, value: f64) {
        self.count += 1.0;
        let delta = value - self.mean;
        self.mean += delta / self.count;
        self.m2 += delta * (value - self.mean);
    }

    /// Parallel combine of two accumulators.
    pub fn merge(&mut self, other: &Welford) {
        if other.count == 0.0 {
            return;
        }
        if self.count == 0.0 {
            *self = *other;
            return;
        }

        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count / count;
        self.m2 += other.m2 + delta * delta * self.count * other.count / count;
        self.count = count;
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2.0 {
            return 0.0;
        }
        self.m2 / self.count
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

struct Bucket {
    start: Duration,
    stats: Welford,
}

/// Sliding window of Welford buckets keyed by sample time.
pub struct LatencyAggregate {
    update_interval: Duration,
    window_len: usize,
    buckets: VecDeque<Bucket>,
}

impl LatencyAggregate {
    pub fn new(update_interval: Duration, window_length: Duration) -> Self {
        let window_len = (window_length.as_nanos() / update_interval.as_nanos().max(1)).max(1);
        Self {
            update_interval,
            window_len: window_len as usize,
            buckets: VecDeque::new(),
        }
    }

    /// Records `value` at time `at` (measured from any fixed epoch, as
    /// long as callers are consistent).
    pub fn update(&mut self, at: Duration, value: f64) {
        let needs_bucket = match self.buckets.back() {
            Some(bucket) => at >= bucket.start + self.update_interval,
            None => true,
        };
        if needs_bucket {
            self.buckets.push_back(Bucket {
                start: at,
                stats: Welford::default(),
            });
            while self.buckets.len() > self.window_len {
                self.buckets.pop_front();
            }
        }

        if let Some(bucket) = self.buckets.back_mut() {
            bucket.stats.update(value);
        }
    }

    /// Merged statistics over the whole window.
    pub fn summarize(&self) -> Welford {
        let mut merged = Welford::default();
        for bucket in &self.buckets {
            merged.merge(&bucket.stats);
        }
        merged
    }

    /// Merged statistics over the trailing `duration` of the window.
    pub fn summarize_last(&self, duration: Duration) -> Welford {
        let newest = match self.buckets.back() {
            Some(bucket) => bucket.start + self.update_interval,
            None => return Welford::default(),
        };
        let cutoff = newest.saturating_sub(duration);

        let mut merged = Welford::default();
        for bucket in self.buckets.iter().rev() {
            if bucket.start + self.update_interval <= cutoff {
                break;
            }
            merged.merge(&bucket.stats);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_mean_and_std_dev() {
        let mut w = Welford::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.update(v);
        }
        assert!((w.mean() - 5.0).abs() < 1e-9);
        assert!((w.std_dev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_welford_merge_equals_sequential() {
        let mut all = Welford::default();
        let mut a = Welford::default();
        let mut b = Welford::default();
        for i in 0..100 {
            let v = (i % 13) as f64;
            all.update(v);
            if i < 40 {
                a.update(v);
            } else {
                b.update(v);
            }
        }

        a.merge(&b);
        assert!((a.mean() - all.mean()).abs() < 1e-9);
        assert!((a.variance() - all.variance()).abs() < 1e-6);
        assert_eq!(a.count(), all.count());
    }

    #[test]
    fn test_window_evicts_old_buckets() {
        let mut agg = LatencyAggregate::new(Duration::from_secs(1), Duration::from_secs(3));

        for sec in 0..10u64 {
            agg.update(Duration::from_secs(sec), sec as f64);
        }

        // only the last three buckets remain
        let merged = agg.summarize();
        assert_eq!(merged.count(), 3.0);
        assert!((merged.mean() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_last_subset() {
        let mut agg = LatencyAggregate::new(Duration::from_secs(1), Duration::from_secs(10));

        for sec in 0..6u64 {
            agg.update(Duration::from_secs(sec), sec as f64);
        }

        let recent = agg.summarize_last(Duration::from_secs(2));
        assert_eq!(recent.count(), 2.0);
        assert!((recent.mean() - 4.5).abs() < 1e-9);

        let whole = agg.summarize();
        assert_eq!(whole.count(), 6.0);
    }
}
