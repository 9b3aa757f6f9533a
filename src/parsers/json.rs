use crate::parsers::RecordParser;
use crate::record::StructuredRecord;
use serde_json::{Map, Value};

const TARGET_KEYS: &[&str] = &["path", "uri", "url", "request_uri"];
const USER_AGENT_KEYS: &[&str] = &["user_agent", "http_user_agent", "agent"];
const REFERER_KEYS: &[&str] = &["referer", "http_referer", "referrer"];
const BODY_SIZE_KEYS: &[&str] = &["body_bytes_sent", "bytes", "body_size", "size"];
const REMOTE_ADDR_KEYS: &[&str] = &["remote_addr", "ip", "client_ip"];
const TIME_KEYS: &[&str] = &["time_local", "timestamp", "time", "ts"];
const STATUS_KEYS: &[&str] = &["status", "status_code"];

/// Generic structured fallback: one JSON object per line with access-log style keys
pub struct JsonParser;

impl JsonParser {
    pub fn new() -> Self {
        Self
    }

    fn first<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|key| map.get(*key))
    }

    fn text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn record_from_map(map: &Map<String, Value>) -> StructuredRecord {
        let mut record = StructuredRecord::default();

        // A full request line wins; explicit method/path keys refine it
        if let Some(request) = map.get("request").and_then(Self::text) {
            record.apply_request_line(&request);
        }
        if let Some(method) = map.get("method").and_then(Self::text) {
            record.method = Some(method);
        }
        if let Some(target) = Self::first(map, TARGET_KEYS).and_then(Self::text) {
            record.set_target(&target);
        }
        if let Some(protocol) = map.get("protocol").and_then(Self::text) {
            record.protocol = Some(protocol);
        }
        if let Some(status) = Self::first(map, STATUS_KEYS).and_then(Self::text) {
            record.set_status_text(&status);
        }
        if let Some(size) = Self::first(map, BODY_SIZE_KEYS).and_then(Self::text) {
            record.set_body_size_text(&size);
        }
        if let Some(user_agent) = Self::first(map, USER_AGENT_KEYS).and_then(Self::text) {
            record.set_user_agent(&user_agent);
        }
        if let Some(referer) = Self::first(map, REFERER_KEYS).and_then(Self::text) {
            record.set_referer(&referer);
        }
        if let Some(addr) = Self::first(map, REMOTE_ADDR_KEYS).and_then(Self::text) {
            record.remote_addr = Some(addr);
        }
        if let Some(time) = Self::first(map, TIME_KEYS).and_then(Self::text) {
            record.time_local = Some(time);
        }
        record.request_time = map.get("request_time").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        });

        record.finish()
    }
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, line: &str) -> Option<StructuredRecord> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }

        match serde_json::from_str::<Value>(line).ok()? {
            Value::Object(map) => Some(Self::record_from_map(&map)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_access_record() {
        let parser = JsonParser::new();
        let record = parser
            .parse(r#"{"method":"DELETE","uri":"/api/items/7?force=true","status":"404","http_user_agent":"sqlmap/1.5","bytes":17}"#)
            .unwrap();

        assert_eq!(record.method.as_deref(), Some("DELETE"));
        assert_eq!(record.path_only, "/api/items/7");
        assert_eq!(record.query_params["force"], vec!["true"]);
        assert_eq!(record.status, 404);
        assert!(record.is_error);
        assert_eq!(record.body_size, 17);
        assert_eq!(record.user_agent.as_deref(), Some("sqlmap/1.5"));
    }

    #[test]
    fn test_json_request_line_and_lenient_numbers() {
        let parser = JsonParser::new();
        let record = parser
            .parse(r#"{"request":"GET /health HTTP/2.0","status":"n/a","body_bytes_sent":"-"}"#)
            .unwrap();

        assert_eq!(record.method.as_deref(), Some("GET"));
        assert_eq!(record.protocol.as_deref(), Some("HTTP/2.0"));
        assert_eq!(record.status, 0);
        assert_eq!(record.body_size, 0);
    }

    #[test]
    fn test_json_missing_path_defaults_to_root() {
        let parser = JsonParser::new();
        let record = parser.parse(r#"{"status":200}"#).unwrap();
        assert_eq!(record.path, "/");
        assert_eq!(record.method_or_unknown(), "UNKNOWN");
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        let parser = JsonParser::new();
        assert!(parser.parse("[1,2,3]").is_none());
        assert!(parser.parse("{not json").is_none());
    }
}
