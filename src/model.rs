//! Scoring model contract and the bundled pattern-based backend.

use crate::record::decode_component;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::RwLock;

pub const PAD_TOKEN: &str = "[PAD]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const MASK_TOKEN: &str = "[MASK]";
pub const UNK_TOKEN: &str = "[UNK]";

const SPECIAL_TOKENS: [&str; 5] = [PAD_TOKEN, CLS_TOKEN, SEP_TOKEN, MASK_TOKEN, UNK_TOKEN];
const PAD_ID: u32 = 0;
const UNK_ID: u32 = 4;

pub const DEFAULT_VOCAB_SIZE: usize = 10_000;

/// One model-ready sequence. Both vectors have the requested `max_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    pub token_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
}

/// Per-sequence outputs, positionally aligned with the input batch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferenceOutput {
    pub anomaly_scores: Vec<f32>,
    pub confidences: Vec<f32>,
}

/// The expensive collaborator the scheduler batches for.
///
/// `infer` may be called from several dispatcher threads at once.
pub trait ScoringModel: Send + Sync {
    fn name(&self) -> &str {
        "model"
    }

    fn encode(&self, tokens: &[String], max_length: usize) -> EncodedInput;

    fn infer(&self, batch: &[EncodedInput]) -> Result<InferenceOutput>;
}

/// Bounded token vocabulary with BERT-style special tokens at ids 0..=4
#[derive(Debug, Clone)]
pub struct Vocabulary {
    token_to_id: HashMap<String, u32>,
    id_to_token: Vec<String>,
    capacity: usize,
}

impl Vocabulary {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(SPECIAL_TOKENS.len());
        let mut vocab = Self {
            token_to_id: HashMap::new(),
            id_to_token: Vec::new(),
            capacity,
        };
        for token in SPECIAL_TOKENS {
            vocab.insert(token);
        }
        vocab
    }

    fn insert(&mut self, token: &str) -> u32 {
        let id = self.id_to_token.len() as u32;
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.push(token.to_string());
        id
    }

    /// Id for `token`, growing the vocabulary until it is full; `[UNK]` after that
    pub fn add_token(&mut self, token: &str) -> u32 {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }
        if self.id_to_token.len() >= self.capacity {
            return UNK_ID;
        }
        self.insert(token)
    }

    pub fn id_of(&self, token: &str) -> u32 {
        self.token_to_id.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token_of(&self, id: u32) -> &str {
        self.id_to_token
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// `[CLS] tokens.. [SEP]` truncated and padded to exactly `max_length`
    pub fn encode(&mut self, tokens: &[String], max_length: usize) -> EncodedInput {
        let body = tokens.len().min(max_length.saturating_sub(2));
        let mut token_ids = Vec::with_capacity(max_length.max(body + 2));

        token_ids.push(self.id_of(CLS_TOKEN));
        for token in &tokens[..body] {
            token_ids.push(self.add_token(token));
        }
        token_ids.push(self.id_of(SEP_TOKEN));

        token_ids.resize(max_length, PAD_ID);

        let attention_mask = token_ids
            .iter()
            .map(|&id| u8::from(id != PAD_ID))
            .collect();

        EncodedInput {
            token_ids,
            attention_mask,
        }
    }

    /// Attended, non-special tokens of one sequence
    pub fn decode<'a>(&'a self, input: &EncodedInput) -> Vec<&'a str> {
        input
            .token_ids
            .iter()
            .zip(&input.attention_mask)
            .filter(|(_, mask)| **mask == 1)
            .map(|(&id, _)| self.token_of(id))
            .filter(|token| !SPECIAL_TOKENS.contains(token))
            .collect()
    }
}

const THREAT_PATTERNS: &[&str] = &[
    "union select",
    "drop table",
    "script>",
    "javascript:",
    "eval(",
    "onclick=",
    "onerror=",
    "../",
    "etc/passwd",
    "cmd.exe",
    "whoami",
    "nc -e",
    "wget http",
];

const BASELINE_SCORE: f32 = 0.1;
const FIRST_HIT_SCORE: f32 = 0.8;
const EXTRA_HIT_SCORE: f32 = 0.05;
const MAX_SCORE: f32 = 0.95;

/// Rule-based reference backend: decodes each sequence and matches it against
/// known injection and traversal markers.
///
/// The vocabulary lock covers decoding only; scoring works on owned text so
/// `encode` on the submit path never waits for a batch being scored.
#[derive(Debug)]
pub struct PatternModel {
    vocab: RwLock<Vocabulary>,
}

impl PatternModel {
    pub fn new() -> Self {
        Self::with_vocab_size(DEFAULT_VOCAB_SIZE)
    }

    pub fn with_vocab_size(vocab_size: usize) -> Self {
        Self {
            vocab: RwLock::new(Vocabulary::new(vocab_size)),
        }
    }

    pub fn vocab_len(&self) -> usize {
        self.vocab.read().map(|v| v.len()).unwrap_or_default()
    }

    /// Lower-cased, percent-decoded text of every sequence in the batch
    fn decode_batch(&self, batch: &[EncodedInput]) -> Result<Vec<String>> {
        let vocab = self
            .vocab
            .read()
            .map_err(|_| anyhow!("vocabulary lock poisoned"))?;

        Ok(batch
            .iter()
            .map(|input| {
                vocab
                    .decode(input)
                    .iter()
                    .map(|token| decode_component(token))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase()
            })
            .collect())
    }

    fn score_text(text: &str) -> f32 {
        let hits = THREAT_PATTERNS
            .iter()
            .filter(|pattern| text.contains(*pattern))
            .count();
        match hits {
            0 => BASELINE_SCORE,
            n => (FIRST_HIT_SCORE + EXTRA_HIT_SCORE * (n - 1) as f32).min(MAX_SCORE),
        }
    }
}

impl Default for PatternModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoringModel for PatternModel {
    fn name(&self) -> &str {
        "pattern"
    }

    fn encode(&self, tokens: &[String], max_length: usize) -> EncodedInput {
        match self.vocab.write() {
            Ok(mut vocab) => vocab.encode(tokens, max_length),
            Err(poisoned) => poisoned.into_inner().encode(tokens, max_length),
        }
    }

    fn infer(&self, batch: &[EncodedInput]) -> Result<InferenceOutput> {
        let texts = self.decode_batch(batch)?;

        let mut output = InferenceOutput {
            anomaly_scores: Vec::with_capacity(texts.len()),
            confidences: Vec::with_capacity(texts.len()),
        };
        for text in &texts {
            let score = Self::score_text(text);
            output.anomaly_scores.push(score);
            output.confidences.push(((score - 0.5).abs() * 2.0).min(1.0));
        }

        Ok(output)
    }
}
