// Core library for reqscore: request template mining and micro-batched anomaly scoring

pub mod cli;
pub mod config;
pub mod decompression;
pub mod drain;
pub mod error_handling;
pub mod features;
pub mod model;
pub mod normalize;
pub mod parsers;
pub mod pipeline;
pub mod platform;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod stats;

pub use config::ServiceConfig;
pub use drain::{MinerConfig, TemplateMiner};
pub use error_handling::{ConfigError, ParseFailure, ScoringFailure, ServiceError, SubmitError};
pub use model::{EncodedInput, InferenceOutput, PatternModel, ScoringModel};
pub use pipeline::{PreprocessingPipeline, ProcessedEntry};
pub use scheduler::{BatchScheduler, CompletionHandle, JobOutcome, SchedulerConfig};
pub use service::{PendingScore, ScoringRequest, ScoringResponse, ScoringService};
pub use stats::{StatsAggregator, StatsSnapshot};
