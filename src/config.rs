use crate::drain::MinerConfig;
use crate::error_handling::ConfigError;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_MAX_LENGTH: usize = 128;
const MAX_DEFAULT_WORKERS: usize = 8;

/// Main configuration struct for the scoring service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub miner: MinerConfig,
    pub scheduler: SchedulerConfig,
    /// Encoded sequence length handed to the model, framing tokens included
    pub max_length: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            miner: MinerConfig::default(),
            scheduler: SchedulerConfig::default(),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

impl ServiceConfig {
    /// Create configuration from CLI arguments
    pub fn from_cli(cli: &crate::cli::Cli) -> Self {
        Self {
            miner: MinerConfig {
                depth: cli.depth,
                max_children: cli.max_children,
                similarity: cli.similarity,
                max_clusters: cli.max_clusters,
            },
            scheduler: SchedulerConfig {
                max_batch_size: cli.batch_size,
                batch_timeout: cli.batch_timeout,
                queue_capacity: cli.queue_capacity,
                dispatch_workers: effective_workers(cli.workers),
                inference_timeout: cli.inference_timeout,
                threshold: cli.threshold as f32,
                ..SchedulerConfig::default()
            },
            max_length: cli.max_length,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.miner.validate()?;
        self.scheduler.validate()?;
        if self.max_length < 3 {
            return Err(ConfigError::TooSmall {
                name: "max_length",
                min: 3,
                value: self.max_length,
            });
        }
        Ok(())
    }
}

/// Get effective dispatcher count: 0 means one per CPU, capped
pub fn effective_workers(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
    } else {
        requested
    }
}
