use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::ServiceConfig;
use crate::drain::TemplateSummary;
use crate::error_handling::ServiceError;
use crate::model::ScoringModel;
use crate::pipeline::PreprocessingPipeline;
use crate::record::RawLine;
use crate::scheduler::{BatchScheduler, CompletionHandle};
use crate::stats::{StatsAggregator, StatsSnapshot};

const LOG_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S +0000";

/// Transport-agnostic description of one HTTP request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringRequest {
    pub method: String,
    pub uri: String,
    pub headers: IndexMap<String, String>,
    pub remote_addr: String,
    pub user_agent: String,
    pub body: Option<String>,
    /// Access-log time text (`23/Sep/2025:10:30:00 +0000`); now when absent
    pub timestamp: Option<String>,
}

impl ScoringRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Render as a combined-log-format line so requests and logs share one path
    pub fn to_log_line(&self) -> String {
        let timestamp = self
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().format(LOG_TIME_FORMAT).to_string());
        let user_agent = if self.user_agent.is_empty() {
            self.header("user-agent").unwrap_or_default()
        } else {
            self.user_agent.as_str()
        };
        let referer = self.header("referer").unwrap_or("-");
        let remote_addr = if self.remote_addr.is_empty() {
            "-"
        } else {
            self.remote_addr.as_str()
        };
        let method = if self.method.is_empty() {
            "-"
        } else {
            self.method.as_str()
        };
        let uri = if self.uri.is_empty() {
            "/".to_string()
        } else {
            escape_field(&self.uri).replace(' ', "%20")
        };
        let body_len = self.body.as_deref().map_or(0, str::len);

        format!(
            r#"{} - - [{}] "{} {} HTTP/1.1" 200 {} "{}" "{}""#,
            remote_addr,
            timestamp,
            method,
            uri,
            body_len,
            escape_field(referer),
            escape_field(user_agent)
        )
    }
}

/// Quotes would end the quoted log field early
fn escape_field(value: &str) -> String {
    value.replace('"', "%22")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringResponse {
    pub request_id: String,
    pub anomaly_score: f32,
    pub is_anomalous: bool,
    pub confidence: f32,
    pub template_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub features: IndexMap<String, Value>,
    pub processing_time_ms: f64,
}

/// `req_{unix_millis}_{hash % 10000}`
pub fn request_id(line: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("req_{}_{:04}", millis, xxh3_64(line.as_bytes()) % 10_000)
}

/// A submitted request whose score has not been collected yet
#[derive(Debug)]
pub struct PendingScore {
    request_id: String,
    template_id: u64,
    template: String,
    features: IndexMap<String, Value>,
    handle: CompletionHandle,
}

impl PendingScore {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    pub fn wait(self) -> Result<ScoringResponse, ServiceError> {
        let outcome = self.handle.wait()?;
        if let Some(failure) = &outcome.failure {
            tracing::debug!(request_id = %self.request_id, error = %failure, "scored neutral");
        }

        Ok(ScoringResponse {
            request_id: self.request_id,
            anomaly_score: outcome.anomaly_score,
            is_anomalous: outcome.is_anomalous,
            confidence: outcome.confidence,
            template_id: Some(self.template_id),
            template: Some(self.template),
            features: self.features,
            processing_time_ms: outcome.latency.as_secs_f64() * 1000.0,
        })
    }
}

/// Preprocessing, model and scheduler behind one scoring entry point.
///
/// Preprocessing is serialized through a mutex held for one line at a time;
/// encoding and inference run outside it.
pub struct ScoringService {
    config: ServiceConfig,
    pipeline: Mutex<PreprocessingPipeline>,
    model: Arc<dyn ScoringModel>,
    scheduler: BatchScheduler,
    stats: Arc<StatsAggregator>,
}

impl ScoringService {
    pub fn new(config: ServiceConfig, model: Arc<dyn ScoringModel>) -> Result<Self> {
        config.validate()?;

        let pipeline = PreprocessingPipeline::new(config.miner.clone())?;
        let stats = Arc::new(StatsAggregator::new());
        let scheduler =
            BatchScheduler::start(config.scheduler.clone(), Arc::clone(&model), Arc::clone(&stats))?;

        tracing::info!(
            model = model.name(),
            max_batch_size = config.scheduler.max_batch_size,
            dispatch_workers = config.scheduler.dispatch_workers,
            "scoring service ready"
        );

        Ok(Self {
            config,
            pipeline: Mutex::new(pipeline),
            model,
            scheduler,
            stats,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn pipeline(&self) -> MutexGuard<'_, PreprocessingPipeline> {
        match self.pipeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Preprocess, encode and enqueue one raw log line without waiting for its score
    pub fn submit_line(&self, line: &str) -> Result<PendingScore, ServiceError> {
        self.submit_raw(&RawLine::new(line, None))
    }

    /// Like [`submit_line`](Self::submit_line), keeping the line's source for diagnostics
    pub fn submit_raw(&self, raw: &RawLine) -> Result<PendingScore, ServiceError> {
        let received_at = Instant::now();
        let line = raw.text.as_str();
        let entry = self.pipeline().process(raw)?;

        let tokens = entry.token_sequence();
        let encoded = self.model.encode(&tokens, self.config.max_length);
        let handle = self.scheduler.submit_at(encoded, received_at)?;

        Ok(PendingScore {
            request_id: request_id(line),
            template_id: entry.cluster_id,
            template: entry.template,
            features: entry.features.to_map(),
            handle,
        })
    }

    pub fn score_line(&self, line: &str) -> Result<ScoringResponse, ServiceError> {
        self.submit_line(line)?.wait()
    }

    pub fn score(&self, request: &ScoringRequest) -> Result<ScoringResponse, ServiceError> {
        self.score_line(&request.to_log_line())
    }

    /// Submits every request before waiting so they can share batches; results
    /// keep the input order.
    pub fn score_batch(&self, requests: &[ScoringRequest]) -> Vec<Result<ScoringResponse, ServiceError>> {
        let pending: Vec<Result<PendingScore, ServiceError>> = requests
            .iter()
            .map(|request| self.submit_line(&request.to_log_line()))
            .collect();

        pending
            .into_iter()
            .map(|submitted| submitted.and_then(PendingScore::wait))
            .collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn templates(&self) -> Vec<TemplateSummary> {
        self.pipeline().templates()
    }

    /// (accepted, rejected) line counts seen by preprocessing
    pub fn line_counts(&self) -> (u64, u64) {
        self.pipeline().counts()
    }

    /// Stop accepting work and resolve everything already queued
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
