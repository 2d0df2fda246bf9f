use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::server::monitoring::FETCH_METRICS;

use super::types::FailureReason;

/// Monotonic counters for one engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsCounters {
    /// Batch requests sent, retries included.
    pub attempts: u64,
    /// Batch requests repeated after a transport failure.
    pub retries: u64,
    pub batches: u64,
    pub successes: u64,
    pub failures: u64,
    /// Transactions contained in fetched blocks.
    pub transactions: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub counters: StatsCounters,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    pub fn resolved(&self) -> u64 {
        self.counters.successes + self.counters.failures
    }

    /// Resolved slots per second since the collector started.
    pub fn throughput_per_sec(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= f64::EPSILON {
            return 0.0;
        }
        self.resolved() as f64 / seconds
    }

    pub fn success_rate_percent(&self) -> f64 {
        match self.resolved() {
            0 => 0.0,
            resolved => self.counters.successes as f64 * 100.0 / resolved as f64,
        }
    }

    pub fn average_batch_size(&self) -> f64 {
        match self.counters.batches {
            0 => 0.0,
            batches => self.resolved() as f64 / batches as f64,
        }
    }
}

/// Thread-safe run counters behind one short-held lock.
///
/// When the metrics registry is installed, every update is mirrored to Prometheus.
#[derive(Debug)]
pub struct StatsCollector {
    started_at: Instant,
    counters: Mutex<StatsCounters>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Mutex::new(StatsCounters::default()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut StatsCounters)) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut counters);
    }

    pub fn record_attempt(&self) {
        self.update(|counters| counters.attempts += 1);
        if let Some(metrics) = FETCH_METRICS.get() {
            metrics.batch_requests_total.inc();
        }
    }

    pub fn record_retry(&self) {
        self.update(|counters| counters.retries += 1);
        if let Some(metrics) = FETCH_METRICS.get() {
            metrics.batch_retries_total.inc();
        }
    }

    pub fn record_batch(&self) {
        self.update(|counters| counters.batches += 1);
    }

    pub fn record_success(&self, transactions: u64) {
        self.update(|counters| {
            counters.successes += 1;
            counters.transactions += transactions;
        });
        if let Some(metrics) = FETCH_METRICS.get() {
            metrics.slots_succeeded_total.inc();
        }
    }

    /// Counts `slots` failures sharing one reason.
    pub fn record_failures(&self, reason: &FailureReason, slots: u64) {
        self.update(|counters| counters.failures += slots);
        if let Some(metrics) = FETCH_METRICS.get() {
            metrics.record_failed_slots(reason.label(), slots);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = *self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            counters,
            elapsed: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StatsCollector, StatsCounters, StatsSnapshot};
    use crate::fetch_service::types::FailureReason;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(StatsCollector::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    stats.record_attempt();
                    stats.record_success(2);
                    stats.record_failures(&FailureReason::NotFound, 1);
                }
            }));
        }
        for handle in handles {
            handle.await.expect("stats task panicked");
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.counters.attempts, 2_000);
        assert_eq!(snapshot.counters.successes, 2_000);
        assert_eq!(snapshot.counters.failures, 2_000);
        assert_eq!(snapshot.counters.transactions, 4_000);
    }

    #[test]
    fn derived_rates() {
        let snapshot = StatsSnapshot {
            counters: StatsCounters {
                batches: 2,
                successes: 8,
                failures: 2,
                ..StatsCounters::default()
            },
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(snapshot.resolved(), 10);
        assert!((snapshot.throughput_per_sec() - 2.0).abs() < f64::EPSILON);
        assert!((snapshot.success_rate_percent() - 80.0).abs() < f64::EPSILON);
        assert!((snapshot.average_batch_size() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let snapshot = StatsCollector::new().snapshot();
        assert_eq!(snapshot.success_rate_percent(), 0.0);
        assert_eq!(snapshot.average_batch_size(), 0.0);
    }
}
