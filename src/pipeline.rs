use crate::drain::{ChangeType, MinerConfig, TemplateMiner, TemplateSummary};
use crate::error_handling::ParseFailure;
use crate::features::{FeatureExtractor, FeatureVector};
use crate::normalize::normalize;
use crate::parsers::LineParser;
use crate::record::{RawLine, StructuredRecord};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

const NO_PARAMS: &str = "NO_PARAMS";

/// Everything preprocessing learned about one line
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEntry {
    pub record: StructuredRecord,
    pub signature: String,
    pub normalized_signature: String,
    pub cluster_id: u64,
    pub template: String,
    pub cluster_size: usize,
    pub template_change: ChangeType,
    pub features: FeatureVector,
}

impl ProcessedEntry {
    /// Model input tokens: method, path, status, agent family, then `key=value` query pairs
    pub fn token_sequence(&self) -> Vec<String> {
        let record = &self.record;
        let mut tokens = vec![
            record.method_or_unknown().to_string(),
            record.path_only.clone(),
            record.status.to_string(),
        ];

        if let Some(family) = record.user_agent.as_deref().map(agent_family) {
            tokens.push(family.to_string());
        }

        for key in record.sorted_query_keys() {
            if let Some(values) = record.query_params.get(key) {
                for value in values {
                    tokens.push(format!("{key}={value}"));
                }
            }
        }

        tokens
    }
}

/// `{method} {path_only} {status} {query keys | NO_PARAMS} {user_agent}`
pub fn build_signature(record: &StructuredRecord) -> String {
    let keys = record.sorted_query_keys();
    let params = if keys.is_empty() {
        NO_PARAMS.to_string()
    } else {
        keys.join(",")
    };

    format!(
        "{} {} {} {} {}",
        record.method_or_unknown(),
        record.path_only,
        record.status,
        params,
        record.user_agent_or_empty()
    )
}

/// Coarse client family used as a single model token
pub fn agent_family(user_agent: &str) -> &'static str {
    if user_agent.contains("Mozilla") {
        "Mozilla"
    } else if user_agent.contains("curl") {
        "curl"
    } else if user_agent.contains("python") {
        "python"
    } else {
        "Other-Agent"
    }
}

/// Parse -> signature -> normalize -> mine -> features.
///
/// Owns the miner's cluster table; callers that share a pipeline across
/// threads serialize access to it.
pub struct PreprocessingPipeline {
    parser: LineParser,
    miner: TemplateMiner,
    extractor: FeatureExtractor,
    processed: u64,
    rejected: u64,
}

impl PreprocessingPipeline {
    pub fn new(miner_config: MinerConfig) -> Result<Self> {
        Ok(Self {
            parser: LineParser::new()?,
            miner: TemplateMiner::new(miner_config)?,
            extractor: FeatureExtractor::new(),
            processed: 0,
            rejected: 0,
        })
    }

    pub fn process(&mut self, raw: &RawLine) -> Result<ProcessedEntry, ParseFailure> {
        let source = raw.source.as_deref().unwrap_or("-");
        match self.process_line(&raw.text) {
            Ok(entry) => {
                let queued = Utc::now().signed_duration_since(raw.ingested_at);
                tracing::trace!(
                    source,
                    cluster_id = entry.cluster_id,
                    queued_ms = queued.num_milliseconds(),
                    "line processed"
                );
                Ok(entry)
            }
            Err(err) => {
                tracing::debug!(source, error = %err, "line rejected");
                Err(err)
            }
        }
    }

    pub fn process_line(&mut self, line: &str) -> Result<ProcessedEntry, ParseFailure> {
        let record = match self.parser.parse(line) {
            Ok(record) => record,
            Err(err) => {
                self.rejected += 1;
                return Err(err);
            }
        };

        let signature = build_signature(&record);
        let normalized_signature = normalize(&signature);
        let mined = self.miner.add(&normalized_signature);

        match mined.change {
            ChangeType::ClusterCreated => {
                tracing::debug!(cluster_id = mined.cluster_id, template = %mined.template, "new template");
            }
            ChangeType::ClusterEvicted { evicted_id } => {
                tracing::debug!(
                    cluster_id = mined.cluster_id,
                    evicted_id,
                    "template slot reused"
                );
            }
            ChangeType::TemplateChanged | ChangeType::None => {}
        }

        let features = self.extractor.extract(&record);
        self.processed += 1;

        Ok(ProcessedEntry {
            record,
            signature,
            normalized_signature,
            cluster_id: mined.cluster_id,
            template: mined.template,
            cluster_size: mined.size,
            template_change: mined.change,
            features,
        })
    }

    pub fn templates(&self) -> Vec<TemplateSummary> {
        self.miner.templates()
    }

    pub fn cluster_count(&self) -> usize {
        self.miner.cluster_count()
    }

    /// (processed, rejected) line counts
    pub fn counts(&self) -> (u64, u64) {
        (self.processed, self.rejected)
    }
}
