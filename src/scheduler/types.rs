//! Type definitions for the micro-batch scheduler
//!
//! Contains configuration, jobs, batches, outcomes and the completion handle.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::error_handling::{ConfigError, ScoringFailure, ServiceError};
use crate::model::EncodedInput;

/// Configuration for the batch scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    /// Collection window measured from the first job of a batch
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
    /// Maximum number of batches inside `infer` at the same time
    pub dispatch_workers: usize,
    /// Advisory deadline; a late batch resolves with the neutral result
    pub inference_timeout: Option<Duration>,
    pub idle_backoff: Duration,
    pub threshold: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_timeout: Duration::from_millis(10),
            queue_capacity: 1000,
            dispatch_workers: 2,
            inference_timeout: None,
            idle_backoff: Duration::from_millis(1),
            threshold: 0.5,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::OutOfUnitRange {
                name: "threshold",
                value: f64::from(self.threshold),
            });
        }
        for (name, value) in [
            ("max_batch_size", self.max_batch_size),
            ("queue_capacity", self.queue_capacity),
            ("dispatch_workers", self.dispatch_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::TooSmall {
                    name,
                    min: 1,
                    value,
                });
            }
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("batch_timeout"));
        }
        if self.inference_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDuration("inference_timeout"));
        }
        Ok(())
    }
}

/// Resolution of one job. A failed batch yields the neutral result with `failure` set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub sequence: u64,
    pub batch_id: u64,
    pub anomaly_score: f32,
    pub confidence: f32,
    pub is_anomalous: bool,
    #[serde(skip)]
    pub latency: Duration,
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<ScoringFailure>,
}

fn serialize_failure<S: serde::Serializer>(
    failure: &Option<ScoringFailure>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(failure) => serializer.serialize_some(&failure.to_string()),
        None => serializer.serialize_none(),
    }
}

impl JobOutcome {
    pub(crate) fn scored(
        sequence: u64,
        batch_id: u64,
        score: f32,
        confidence: f32,
        threshold: f32,
        latency: Duration,
    ) -> Self {
        Self {
            sequence,
            batch_id,
            anomaly_score: score,
            confidence,
            is_anomalous: score > threshold,
            latency,
            failure: None,
        }
    }

    pub(crate) fn neutral(
        sequence: u64,
        batch_id: u64,
        failure: ScoringFailure,
        latency: Duration,
    ) -> Self {
        Self {
            sequence,
            batch_id,
            anomaly_score: 0.0,
            confidence: 0.0,
            is_anomalous: false,
            latency,
            failure: Some(failure),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.failure.is_some()
    }
}

/// One queued scoring request
pub(crate) struct BatchJob {
    pub sequence: u64,
    pub input: EncodedInput,
    pub received_at: Instant,
    pub reply: Sender<JobOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Collecting,
    Dispatched,
    Completed,
    Failed,
}

/// Jobs in arrival order plus the batch's lifecycle state
pub(crate) struct Batch {
    pub id: u64,
    pub jobs: Vec<BatchJob>,
    pub state: BatchState,
}

impl Batch {
    pub fn collecting(id: u64, capacity: usize) -> Self {
        Self {
            id,
            jobs: Vec::with_capacity(capacity),
            state: BatchState::Collecting,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Single-use receiver for one job's outcome. Dropping it cancels interest only;
/// the scheduler still resolves the job.
#[derive(Debug)]
pub struct CompletionHandle {
    sequence: u64,
    receiver: Receiver<JobOutcome>,
}

impl CompletionHandle {
    pub(crate) fn new(sequence: u64, receiver: Receiver<JobOutcome>) -> Self {
        Self { sequence, receiver }
    }

    /// Arrival sequence number assigned at submit time
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn wait(self) -> Result<JobOutcome, ServiceError> {
        self.receiver.recv().map_err(|_| ServiceError::Dropped)
    }

    /// `Ok(None)` when the outcome is not ready within `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<JobOutcome>, ServiceError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ServiceError::Dropped),
        }
    }

    /// True once an outcome is waiting; `wait` will not block
    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }

    pub fn try_result(&self) -> Result<Option<JobOutcome>, ServiceError> {
        match self.receiver.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ServiceError::Dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_config() {
        let bad_threshold = SchedulerConfig {
            threshold: 1.2,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            bad_threshold.validate(),
            Err(ConfigError::OutOfUnitRange { name: "threshold", .. })
        ));

        let zero_workers = SchedulerConfig {
            dispatch_workers: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(ConfigError::TooSmall { name: "dispatch_workers", .. })
        ));

        let zero_window = SchedulerConfig {
            batch_timeout: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            zero_window.validate(),
            Err(ConfigError::ZeroDuration("batch_timeout"))
        );
    }

    #[test]
    fn threshold_is_strict() {
        let at = JobOutcome::scored(1, 1, 0.5, 0.0, 0.5, Duration::ZERO);
        let above = JobOutcome::scored(2, 1, 0.51, 0.02, 0.5, Duration::ZERO);
        assert!(!at.is_anomalous);
        assert!(above.is_anomalous);
    }

    #[test]
    fn handle_reports_dropped_sender() {
        let (tx, rx) = bounded(1);
        let handle = CompletionHandle::new(7, rx);
        assert_eq!(handle.try_result(), Ok(None));
        drop(tx);
        assert_eq!(handle.sequence(), 7);
        assert_eq!(handle.wait(), Err(ServiceError::Dropped));
    }

    #[test]
    fn handle_waits_with_timeout() {
        let (tx, rx) = bounded(1);
        let handle = CompletionHandle::new(1, rx);
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)), Ok(None));

        let outcome = JobOutcome::neutral(1, 3, ScoringFailure::Panicked, Duration::ZERO);
        tx.send(outcome.clone()).unwrap();
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(50)),
            Ok(Some(outcome))
        );
    }
}
