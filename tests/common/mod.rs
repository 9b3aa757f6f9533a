// tests/common/mod.rs
// Shared test utilities for integration tests
#![allow(dead_code)]

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use reqscore::model::{EncodedInput, InferenceOutput, ScoringModel};
use tempfile::NamedTempFile;

pub const BENIGN_LINE: &str = r#"192.168.1.10 - - [23/Sep/2025:10:30:00 +0000] "GET /products/42 HTTP/1.1" 200 1234 "-" "Mozilla/5.0 (X11; Linux x86_64)""#;
pub const SQLI_LINE: &str = r#"203.0.113.7 - - [23/Sep/2025:10:30:01 +0000] "GET /search?q=1%27%20UNION%20SELECT%20password%20FROM%20users-- HTTP/1.1" 200 88 "-" "sqlmap/1.7""#;
pub const TRAVERSAL_LINE: &str = r#"203.0.113.8 - - [23/Sep/2025:10:30:02 +0000] "GET /download?file=../../etc/passwd HTTP/1.1" 404 0 "-" "curl/8.0""#;

/// Run the built binary with the given arguments and stdin
pub fn run_reqscore_with_input(args: &[&str], input: &str) -> (String, String, i32) {
    run_reqscore_with_bytes(args, input.as_bytes())
}

/// Like `run_reqscore_with_input`, for stdin that is not valid UTF-8
pub fn run_reqscore_with_bytes(args: &[&str], input: &[u8]) -> (String, String, i32) {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_reqscore"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start reqscore");

    if let Some(mut stdin) = cmd.stdin.take() {
        stdin
            .write_all(input)
            .expect("Failed to write to stdin");
    }

    let output = cmd.wait_with_output().expect("Failed to read output");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

/// Run the built binary with a temporary file holding `file_content`
pub fn run_reqscore_with_file(args: &[&str], file_content: &str) -> (String, String, i32) {
    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file
        .write_all(file_content.as_bytes())
        .expect("Failed to write to temp file");

    let mut full_args = args.to_vec();
    full_args.push(temp_file.path().to_str().unwrap());
    run_reqscore_with_files(&full_args, &[])
}

pub fn run_reqscore_with_files(args: &[&str], files: &[&str]) -> (String, String, i32) {
    let mut full_args = args.to_vec();
    full_args.extend(files);

    let output = Command::new(env!("CARGO_BIN_EXE_reqscore"))
        .args(&full_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute reqscore");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

/// Parse JSONL output into values, skipping blank lines
pub fn parse_json_lines(output: &str) -> Vec<serde_json::Value> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("Output line should be valid JSON"))
        .collect()
}

/// Model whose score is the first token id of each input scaled into [0, 1].
/// Records the size of every batch it sees.
#[derive(Default)]
pub struct RecordingModel {
    pub batch_sizes: Mutex<Vec<usize>>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl RecordingModel {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

/// Input carrying `marker` as its first token id
pub fn marked_input(marker: u32) -> EncodedInput {
    EncodedInput {
        token_ids: vec![marker, 0, 0],
        attention_mask: vec![1, 0, 0],
    }
}

impl ScoringModel for RecordingModel {
    fn name(&self) -> &str {
        "recording"
    }

    fn encode(&self, tokens: &[String], max_length: usize) -> EncodedInput {
        let mut token_ids: Vec<u32> = tokens.iter().map(|t| t.len() as u32).collect();
        token_ids.resize(max_length, 0);
        let attention_mask = token_ids.iter().map(|&id| u8::from(id != 0)).collect();
        EncodedInput {
            token_ids,
            attention_mask,
        }
    }

    fn infer(&self, inputs: &[EncodedInput]) -> Result<InferenceOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(inputs.len());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let anomaly_scores = inputs
            .iter()
            .map(|input| input.token_ids.first().copied().unwrap_or(0) as f32 / 100.0)
            .map(|score| score.min(1.0))
            .collect::<Vec<_>>();
        let confidences = vec![1.0; inputs.len()];
        Ok(InferenceOutput {
            anomaly_scores,
            confidences,
        })
    }
}

/// Fails every batch that contains an input marked with `poison`
pub struct PoisonModel {
    pub poison: u32,
}

impl ScoringModel for PoisonModel {
    fn encode(&self, _tokens: &[String], max_length: usize) -> EncodedInput {
        EncodedInput {
            token_ids: vec![0; max_length],
            attention_mask: vec![0; max_length],
        }
    }

    fn infer(&self, inputs: &[EncodedInput]) -> Result<InferenceOutput> {
        if inputs
            .iter()
            .any(|input| input.token_ids.first() == Some(&self.poison))
        {
            bail!("poisoned batch");
        }
        Ok(InferenceOutput {
            anomaly_scores: vec![0.9; inputs.len()],
            confidences: vec![0.8; inputs.len()],
        })
    }
}

/// Model that panics on every call
pub struct PanickingModel;

impl ScoringModel for PanickingModel {
    fn encode(&self, _tokens: &[String], max_length: usize) -> EncodedInput {
        EncodedInput {
            token_ids: vec![0; max_length],
            attention_mask: vec![0; max_length],
        }
    }

    fn infer(&self, _inputs: &[EncodedInput]) -> Result<InferenceOutput> {
        panic!("model crashed");
    }
}

pub fn shared<M: ScoringModel + 'static>(model: M) -> Arc<M> {
    Arc::new(model)
}
