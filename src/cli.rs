// Command-line interface definitions

use clap::Parser;
use std::time::Duration;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum StatsFormat {
    Table,
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

fn parse_unit_interval(value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if (0.0..=1.0).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(format!("{} is outside [0, 1]", parsed))
    }
}

#[derive(Parser, Debug)]
#[command(name = "reqscore")]
#[command(about = "Score HTTP access-log lines for anomalies with template mining and micro-batched inference")]
#[command(
    long_about = "Score HTTP access-log lines for anomalies with template mining and micro-batched inference\n\nEvery input line is parsed (combined/common log format or JSON), normalized,\nclustered into a request template and scored. One JSON response is written\nper accepted line; unparseable lines are counted and summarized on stderr.\n\nCOMMON EXAMPLES:\n  reqscore access.log\n  zcat access.log.gz | reqscore --threshold 0.7\n  reqscore access.log.zst --stats --templates -q"
)]
#[command(version)]
#[command(args_override_self = true)]
pub struct Cli {
    /// Input files (stdin if not specified, or use "-" to explicitly specify stdin). gzip and zstd are detected.
    pub files: Vec<String>,

    /// Maximum jobs per model call
    #[arg(long = "batch-size", default_value_t = 32, help_heading = "Batching Options")]
    pub batch_size: usize,

    /// Collection window for a batch, e.g. 10ms
    #[arg(
        long = "batch-timeout",
        default_value = "10ms",
        value_parser = parse_duration,
        help_heading = "Batching Options"
    )]
    pub batch_timeout: Duration,

    /// Pending-job queue capacity; submissions beyond it are rejected
    #[arg(long = "queue-capacity", default_value_t = 1000, help_heading = "Batching Options")]
    pub queue_capacity: usize,

    /// Concurrent model calls (0 = number of CPUs, capped at 8)
    #[arg(long = "workers", default_value_t = 2, help_heading = "Batching Options")]
    pub workers: usize,

    /// Advisory deadline per model call; late batches score neutral
    #[arg(long = "inference-timeout", value_parser = parse_duration, help_heading = "Batching Options")]
    pub inference_timeout: Option<Duration>,

    /// Scores strictly above this are anomalous
    #[arg(long = "threshold", default_value_t = 0.5, value_parser = parse_unit_interval, help_heading = "Scoring Options")]
    pub threshold: f64,

    /// Maximum encoded sequence length including framing tokens
    #[arg(long = "max-length", default_value_t = 128, help_heading = "Scoring Options")]
    pub max_length: usize,

    /// Minimum fraction of matching tokens to join a template
    #[arg(long = "similarity", default_value_t = 0.4, value_parser = parse_unit_interval, help_heading = "Template Options")]
    pub similarity: f64,

    /// Template tree depth
    #[arg(long = "depth", default_value_t = 4, help_heading = "Template Options")]
    pub depth: usize,

    /// Maximum children per template tree node
    #[arg(long = "max-children", default_value_t = 100, help_heading = "Template Options")]
    pub max_children: usize,

    /// Maximum templates per tree leaf before the least recently matched is replaced
    #[arg(long = "max-clusters", default_value_t = 1000, help_heading = "Template Options")]
    pub max_clusters: usize,

    /// Print service statistics to stderr when input ends. Use --stats=json for JSON.
    #[arg(
        long = "stats",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "table",
        value_enum,
        help_heading = "Output Options"
    )]
    pub stats: Option<StatsFormat>,

    /// Print discovered templates to stderr when input ends
    #[arg(long = "templates", help_heading = "Output Options")]
    pub templates: bool,

    /// Suppress per-line JSON output
    #[arg(short = 'q', long = "quiet", help_heading = "Output Options")]
    pub quiet: bool,

    /// Increase diagnostic logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output Options")]
    pub verbose: u8,
}
