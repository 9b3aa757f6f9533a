use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Point-in-time copy of the service counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub anomalous_requests: u64,
    pub anomaly_rate: f64,
    pub avg_processing_time_ms: f64,
    pub uptime_seconds: f64,
    pub failed_requests: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    anomalous_requests: u64,
    failed_requests: u64,
    batches_completed: u64,
    batches_failed: u64,
    avg_processing_time_ms: f64,
}

/// Running totals shared between dispatchers and readers.
///
/// The mean latency is maintained incrementally so no sample history is kept.
#[derive(Debug)]
pub struct StatsAggregator {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    /// One resolved request. Neutral (failed) results count toward the total.
    pub fn record_request(&self, latency: Duration, is_anomalous: bool, failed: bool) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        counters.total_requests += 1;
        if is_anomalous {
            counters.anomalous_requests += 1;
        }
        if failed {
            counters.failed_requests += 1;
        }

        let sample = latency.as_secs_f64() * 1000.0;
        let count = counters.total_requests as f64;
        counters.avg_processing_time_ms += (sample - counters.avg_processing_time_ms) / count;
    }

    pub fn record_batch(&self, completed: bool) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        if completed {
            counters.batches_completed += 1;
        } else {
            counters.batches_failed += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };

        StatsSnapshot {
            total_requests: counters.total_requests,
            anomalous_requests: counters.anomalous_requests,
            anomaly_rate: counters.anomalous_requests as f64
                / counters.total_requests.max(1) as f64,
            avg_processing_time_ms: counters.avg_processing_time_ms,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            failed_requests: counters.failed_requests,
            batches_completed: counters.batches_completed,
            batches_failed: counters.batches_failed,
        }
    }
}

/// One-line human summary for stderr
pub fn format_stats(snapshot: &StatsSnapshot) -> String {
    let mut output = format!(
        "Requests: {} total, {} anomalous ({:.1}%)",
        snapshot.total_requests,
        snapshot.anomalous_requests,
        snapshot.anomaly_rate * 100.0
    );

    if snapshot.failed_requests > 0 {
        output.push_str(&format!(", {} unscored", snapshot.failed_requests));
    }

    output.push_str(&format!(
        "\nBatches: {} completed, {} failed | Avg latency: {:.2}ms | Uptime: {:.1}s",
        snapshot.batches_completed,
        snapshot.batches_failed,
        snapshot.avg_processing_time_ms,
        snapshot.uptime_seconds
    ));

    output
}
