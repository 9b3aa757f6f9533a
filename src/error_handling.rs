use indexmap::IndexMap;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// A raw line that no grammar accepted. The entry is dropped; nothing else is affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("empty line")]
    Empty,
    #[error("unrecognized log format: {0}")]
    UnrecognizedFormat(String),
}

/// Rejection at the scheduler's front door.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Queue is at capacity; the caller should shed load or retry later.
    #[error("scoring queue is full ({capacity} pending jobs)")]
    Backpressure { capacity: usize },
    #[error("scheduler is shut down")]
    Closed,
}

/// Why a dispatched batch ended up resolved with the neutral result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringFailure {
    #[error("model error: {0}")]
    Model(String),
    #[error("model returned {scores} scores and {confidences} confidences for a batch of {expected}")]
    OutputMismatch {
        expected: usize,
        scores: usize,
        confidences: usize,
    },
    #[error("model returned an invalid value {value} at batch position {position}")]
    InvalidScore { position: usize, value: f32 },
    #[error("model panicked during inference")]
    Panicked,
    #[error("inference exceeded the {0:?} deadline")]
    DeadlineExceeded(Duration),
}

/// Invalid startup parameters. Only ever raised while building components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f64 },
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: usize,
        value: usize,
    },
    #[error("{0} must be a non-zero duration")]
    ZeroDuration(&'static str),
}

/// Everything a single scoring call can report back to its caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Parse(#[from] ParseFailure),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    /// Completion handle was dropped by the scheduler without a value (teardown only).
    #[error("scoring job was dropped before it resolved")]
    Dropped,
}

impl ServiceError {
    /// Short category name used for tallies and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Parse(_) => "parse",
            ServiceError::Submit(SubmitError::Backpressure { .. }) => "backpressure",
            ServiceError::Submit(SubmitError::Closed) => "closed",
            ServiceError::Dropped => "dropped",
        }
    }

    /// Whether the caller can reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Submit(SubmitError::Backpressure { .. })
        )
    }
}

const MAX_EXAMPLES: usize = 3;

/// Counts recoverable failures by kind and keeps a few examples of each for
/// the end-of-run summary.
#[derive(Debug, Default)]
pub struct FailureTally {
    counts: IndexMap<&'static str, usize>,
    examples: IndexMap<&'static str, Vec<String>>,
}

impl FailureTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: &'static str, message: impl Into<String>) {
        *self.counts.entry(kind).or_insert(0) += 1;

        let examples = self.examples.entry(kind).or_default();
        if examples.len() < MAX_EXAMPLES {
            examples.push(message.into());
        }
    }

    pub fn record_error(&mut self, error: &ServiceError, context: &str) {
        self.record(error.kind(), format!("{error}: {context}"));
    }

    pub fn count(&self, kind: &str) -> usize {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// JSON summary keyed by failure kind, `None` when nothing failed
    pub fn summary(&self) -> Option<String> {
        if self.counts.is_empty() {
            return None;
        }

        let mut summary = json!({});
        for (kind, count) in &self.counts {
            let examples = self.examples.get(kind).cloned().unwrap_or_default();
            summary[*kind] = json!({
                "count": count,
                "examples": examples,
            });
        }

        Some(
            serde_json::to_string_pretty(&summary)
                .unwrap_or_else(|_| "Error serializing summary".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_keeps_three_examples_per_kind() {
        let mut tally = FailureTally::new();
        for i in 0..5 {
            tally.record("parse", format!("line {i}"));
        }
        tally.record("backpressure", "queue full");

        assert_eq!(tally.count("parse"), 5);
        assert_eq!(tally.count("backpressure"), 1);
        assert_eq!(tally.total(), 6);

        let summary: serde_json::Value =
            serde_json::from_str(&tally.summary().unwrap()).unwrap();
        assert_eq!(summary["parse"]["count"], 5);
        assert_eq!(summary["parse"]["examples"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn empty_tally_has_no_summary() {
        assert!(FailureTally::new().summary().is_none());
    }

    #[test]
    fn only_backpressure_is_retryable() {
        let full = ServiceError::from(SubmitError::Backpressure { capacity: 4 });
        assert!(full.is_retryable());
        assert_eq!(full.kind(), "backpressure");

        let parse = ServiceError::from(ParseFailure::Empty);
        assert!(!parse.is_retryable());
        assert_eq!(parse.kind(), "parse");
    }
}
