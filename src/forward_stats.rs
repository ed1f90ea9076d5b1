//! Transit latency and jitter of packets traversing the node.
//!
//! The forwarder feeds (arrival, departure) pairs in; samples land in a
//! windowed latency aggregate and a reporter thread periodically emits
//! recent and long-window summaries to an external sink.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use parking_lot::Mutex;

use utils::{Fuse, LatencyAggregate};

/// Transit beyond this is assumed to be clock skew, not real latency.
const MAX_TRANSIT: Duration = Duration::from_secs(5);

/// One reporter tick worth of summaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardStatsReport {
    /// Over the last report interval.
    pub latency: Duration,
    pub jitter: Duration,
    /// Over the whole window.
    pub latency_long: Duration,
    pub jitter_long: Duration,
}

pub type OnForwardStatsReport = Arc<dyn Fn(ForwardStatsReport) + Send + Sync>;

pub struct ForwardStats {
    latency: Mutex<LatencyAggregate>,
    last_left_ms: AtomicI64,
    closed: Fuse,
}

impl ForwardStats {
    pub fn new(
        latency_update_interval: Duration,
        report_interval: Duration,
        latency_window_length: Duration,
        on_report: OnForwardStatsReport,
    ) -> Arc<Self> {
        let stats = Arc::new(Self {
            latency: Mutex::new(LatencyAggregate::new(
                latency_update_interval,
                latency_window_length,
            )),
            last_left_ms: AtomicI64::new(0),
            closed: Fuse::new(),
        });

        let reporter = Arc::clone(&stats);
        let builder = thread::Builder::new().name("forward-stats".to_owned());
        if let Err(err) = builder.spawn(move || reporter.report(report_interval, on_report)) {
            error!("failed to spawn forward stats reporter: {err}");
        }

        stats
    }

    /// Records one packet's transit through the node. Duplicate or older
    /// departure timestamps (millisecond resolution) are dropped so that
    /// a burst leaving together counts once.
    pub fn update(&self, arrival: SystemTime, left: SystemTime) {
        let transit = match left.duration_since(arrival) {
            Ok(transit) => transit,
            // negative transit, the system clock was adjusted
            Err(_) => return,
        };
        if transit > MAX_TRANSIT {
            return;
        }

        let left_ms = match left.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(_) => return,
        };
        let last_ms = self.last_left_ms.load(Ordering::Acquire);
        if left_ms <= last_ms
            || self
                .last_left_ms
                .compare_exchange(last_ms, left_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let at = arrival
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.latency.lock().update(at, transit.as_nanos() as f64);
    }

    /// Mean latency and jitter over the whole window.
    pub fn stats(&self) -> (Duration, Duration) {
        let summary = self.latency.lock().summarize();
        let latency = Duration::from_nanos(summary.mean() as u64);
        let jitter = Duration::from_nanos(summary.std_dev() as u64);
        if jitter > Duration::from_secs(10) {
            info!(
                "unexpected forward jitter, jitter: {:?}, count: {:.2}, mean: {:.2}, std dev: {:.2}",
                jitter,
                summary.count(),
                summary.mean(),
                summary.std_dev(),
            );
        }
        (latency, jitter)
    }

    /// Mean latency and jitter over the trailing `duration`.
    pub fn last_stats(&self, duration: Duration) -> (Duration, Duration) {
        let summary = self.latency.lock().summarize_last(duration);
        (
            Duration::from_nanos(summary.mean() as u64),
            Duration::from_nanos(summary.std_dev() as u64),
        )
    }

    pub fn stop(&self) {
        self.closed.close();
    }

    fn report(&self, report_interval: Duration, on_report: OnForwardStatsReport) {
        while !self.closed.wait_timeout(report_interval) {
            let (latency, jitter) = self.last_stats(report_interval);
            let (latency_long, jitter_long) = self.stats();
            on_report(ForwardStatsReport {
                latency,
                jitter,
                latency_long,
                jitter_long,
            });
        }
    }
}

impl Drop for ForwardStats {
    fn drop(&mut self) {
        self.closed.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_stats() -> Arc<ForwardStats> {
        ForwardStats::new(
            Duration::from_millis(100),
            Duration::from_secs(3600),
            Duration::from_secs(10),
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn test_records_transit() {
        let stats = new_stats();
        let base = SystemTime::now();

        for i in 0..10u64 {
            let arrival = base + Duration::from_millis(i * 10);
            let left = arrival + Duration::from_millis(5);
            stats.update(arrival, left);
        }

        let (latency, jitter) = stats.stats();
        assert_eq!(latency, Duration::from_millis(5));
        assert_eq!(jitter, Duration::ZERO);
        stats.stop();
    }

    #[test]
    fn test_rejects_negative_and_huge_transit() {
        let stats = new_stats();
        let base = SystemTime::now();

        // negative
        stats.update(base + Duration::from_millis(100), base);
        // clock skew
        stats.update(base, base + Duration::from_secs(10));

        let summary_count = stats.latency.lock().summarize().count();
        assert_eq!(summary_count, 0.0);
        stats.stop();
    }

    #[test]
    fn test_departure_dedup() {
        let stats = new_stats();
        let base = SystemTime::now();
        let left = base + Duration::from_millis(5);

        // three packets leaving in the same millisecond count once
        stats.update(base, left);
        stats.update(base, left);
        stats.update(base + Duration::from_millis(1), left);
        // an older departure is dropped too
        stats.update(base, left - Duration::from_millis(2));

        let summary_count = stats.latency.lock().summarize().count();
        assert_eq!(summary_count, 1.0);
        stats.stop();
    }

    #[test]
    fn test_reporter_emits() {
        let reports: Arc<Mutex<Vec<ForwardStatsReport>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let stats = ForwardStats::new(
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_secs(1),
            Arc::new(move |report| sink.lock().push(report)),
        );

        let base = SystemTime::now();
        stats.update(base, base + Duration::from_millis(7));

        thread::sleep(Duration::from_millis(100));
        stats.stop();

        let reports = reports.lock();
        assert!(!reports.is_empty());
        assert_eq!(reports[0].latency_long, Duration::from_millis(7));
    }
}
