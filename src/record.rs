use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Query parameters: key to every value it was given, percent-decoded
pub type QueryParams = IndexMap<String, Vec<String>>;

/// A line as it arrived, before any parsing
#[derive(Debug, Clone)]
pub struct RawLine {
    pub text: String,
    pub source: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl RawLine {
    pub fn new(text: impl Into<String>, source: Option<String>) -> Self {
        Self {
            text: text.into(),
            source,
            ingested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MethodCategory {
    Safe,
    Unsafe,
    #[default]
    Unknown,
}

impl MethodCategory {
    pub fn of(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" | "OPTIONS" => MethodCategory::Safe,
            "POST" | "PUT" | "PATCH" | "DELETE" => MethodCategory::Unsafe,
            _ => MethodCategory::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MethodCategory::Safe => "SAFE",
            MethodCategory::Unsafe => "UNSAFE",
            MethodCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MethodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP request as recovered from a log line.
///
/// `path` is the full request target (path plus query), `path_only` the part
/// before `?`. Both default to `/`. `status` defaults to 0 when it is missing
/// or not a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub remote_addr: Option<String>,
    pub time_local: Option<String>,
    pub method: Option<String>,
    pub path: String,
    pub path_only: String,
    pub query_string: String,
    pub query_params: QueryParams,
    pub protocol: Option<String>,
    pub status: u16,
    pub body_size: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub request_time: Option<f64>,
    pub is_error: bool,
    pub has_referer: bool,
    pub method_category: MethodCategory,
}

impl Default for StructuredRecord {
    fn default() -> Self {
        Self {
            remote_addr: None,
            time_local: None,
            method: None,
            path: "/".to_string(),
            path_only: "/".to_string(),
            query_string: String::new(),
            query_params: QueryParams::new(),
            protocol: None,
            status: 0,
            body_size: 0,
            referer: None,
            user_agent: None,
            request_time: None,
            is_error: false,
            has_referer: false,
            method_category: MethodCategory::Unknown,
        }
    }
}

impl StructuredRecord {
    /// Split an HTTP request line (`GET /a?b=1 HTTP/1.1`) into method, target and protocol
    pub fn apply_request_line(&mut self, request: &str) {
        let mut parts = request.splitn(3, ' ');
        if let Some(method) = parts.next().filter(|m| !m.is_empty() && *m != "-") {
            self.method = Some(method.to_string());
        }
        if let Some(target) = parts.next() {
            self.set_target(target);
        }
        if let Some(protocol) = parts.next().filter(|p| !p.is_empty()) {
            self.protocol = Some(protocol.to_string());
        }
    }

    /// Set the request target and derive `path_only`, `query_string` and `query_params`
    pub fn set_target(&mut self, target: &str) {
        let target = target.trim();
        if target.is_empty() {
            return;
        }

        // Absolute-form targets (`http://host/path`) keep only the path part
        let target = strip_authority(target);
        let (path_only, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let path_only = path_only.split('#').next().unwrap_or_default();

        self.path = target.to_string();
        self.path_only = if path_only.is_empty() {
            "/".to_string()
        } else {
            path_only.to_string()
        };
        self.query_string = query.split('#').next().unwrap_or_default().to_string();
        self.query_params = parse_query(&self.query_string);
    }

    pub fn set_referer(&mut self, referer: &str) {
        if referer.is_empty() || referer == "-" {
            self.referer = None;
        } else {
            self.referer = Some(referer.to_string());
        }
    }

    pub fn set_user_agent(&mut self, user_agent: &str) {
        if user_agent.is_empty() || user_agent == "-" {
            self.user_agent = None;
        } else {
            self.user_agent = Some(user_agent.to_string());
        }
    }

    /// Lenient status coercion: anything that is not a number leaves status at 0
    pub fn set_status_text(&mut self, status: &str) {
        if let Ok(code) = status.trim().parse::<u16>() {
            self.status = code;
        }
    }

    /// Lenient size coercion: `-` and garbage leave the size at 0
    pub fn set_body_size_text(&mut self, size: &str) {
        if let Ok(bytes) = size.trim().parse::<u64>() {
            self.body_size = bytes;
        }
    }

    /// Recompute the derived booleans and the method category
    pub fn finish(mut self) -> Self {
        self.is_error = self.status >= 400;
        self.has_referer = self.referer.is_some();
        self.method_category = self
            .method
            .as_deref()
            .map(MethodCategory::of)
            .unwrap_or_default();
        self
    }

    pub fn method_or_unknown(&self) -> &str {
        self.method.as_deref().unwrap_or("UNKNOWN")
    }

    pub fn user_agent_or_empty(&self) -> &str {
        self.user_agent.as_deref().unwrap_or_default()
    }

    /// Path segments, ignoring empty ones (`/a//b/` has depth 2)
    pub fn path_depth(&self) -> usize {
        self.path_only.split('/').filter(|s| !s.is_empty()).count()
    }

    /// Query keys in sorted order
    pub fn sorted_query_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.query_params.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

fn strip_authority(target: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            };
        }
    }
    target
}

/// Decode one query component; `+` means space, bad escapes are kept verbatim
pub fn decode_component(component: &str) -> String {
    let spaced = component.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse `a=1&b=2&a=3` into `{a: [1, 3], b: [2]}`. Pairs with an empty key are skipped.
pub fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        let key = decode_component(key);
        if key.is_empty() {
            continue;
        }
        params
            .entry(key)
            .or_default()
            .push(decode_component(value));
    }
    params
}
