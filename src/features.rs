use crate::record::{decode_component, MethodCategory, StructuredRecord};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

const SQL_KEYWORDS: &[&str] = &["union", "select", "insert", "delete", "drop"];
const XSS_PATTERNS: &[&str] = &["javascript:", "vbscript:", "onload=", "onerror="];
const SCANNER_AGENTS: &[&str] = &["sqlmap", "nmap", "dirb", "nikto"];

/// Fixed-shape per-request features
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureVector {
    pub method: String,
    pub status_code: u16,
    pub path_depth: usize,
    pub query_param_count: usize,
    pub user_agent_length: usize,
    pub is_error: bool,
    pub method_category: MethodCategory,
    pub has_referer: bool,
    pub body_size: u64,
    pub contains_script_tags: bool,
    pub contains_sql_keywords: bool,
    pub contains_xss_patterns: bool,
    pub suspicious_user_agent: bool,
}

impl FeatureVector {
    /// Field name -> JSON value, in declaration order
    pub fn to_map(&self) -> IndexMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => IndexMap::new(),
        }
    }

    /// Number of security indicators that fired
    pub fn indicator_count(&self) -> usize {
        [
            self.contains_script_tags,
            self.contains_sql_keywords,
            self.contains_xss_patterns,
            self.suspicious_user_agent,
        ]
        .iter()
        .filter(|flag| **flag)
        .count()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, record: &StructuredRecord) -> FeatureVector {
        let mut target = decode_component(&record.path_only);
        if !record.query_string.is_empty() {
            target.push('?');
            target.push_str(&decode_component(&record.query_string));
        }
        let target = target.to_lowercase();
        let user_agent = record.user_agent_or_empty();
        let agent_lower = user_agent.to_lowercase();

        FeatureVector {
            method: record.method.clone().unwrap_or_default(),
            status_code: record.status,
            path_depth: record.path_depth(),
            query_param_count: record.query_params.len(),
            user_agent_length: user_agent.chars().count(),
            is_error: record.is_error,
            method_category: record.method_category,
            has_referer: record.has_referer,
            body_size: record.body_size,
            contains_script_tags: target.contains("<script"),
            contains_sql_keywords: contains_any(&target, SQL_KEYWORDS),
            contains_xss_patterns: contains_any(&target, XSS_PATTERNS),
            suspicious_user_agent: contains_any(&agent_lower, SCANNER_AGENTS),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
