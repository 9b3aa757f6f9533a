use crate::parsers::RecordParser;
use crate::record::StructuredRecord;
use anyhow::{Context, Result};
use regex::{Captures, Regex};

/// Apache/NGINX access-log grammars, tried from most to least specific
pub struct CombinedParser {
    combined_with_request_time_regex: Regex,
    combined_regex: Regex,
    common_regex: Regex,
}

impl CombinedParser {
    pub fn new() -> Result<Self> {
        // Combined Log Format with trailing request time (NGINX `$request_time`, quoted or bare)
        // Example: 192.168.1.1 - - [25/Dec/1995:10:00:00 +0000] "GET /index.html HTTP/1.0" 200 1234 "-" "curl/7.68.0" 0.123
        let combined_with_request_time_regex = Regex::new(
            r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "([^"]*)" (\S+) (\S+) "([^"]*)" "([^"]*)"\s+"?([\d.]+|-)"?\s*$"#,
        )
        .context("Failed to compile Combined Log Format with request time regex")?;

        // Combined Log Format (Apache/NGINX with referer and user agent)
        // Example: 192.168.1.1 - user [25/Dec/1995:10:00:00 +0000] "GET /index.html HTTP/1.0" 200 1234 "http://www.example.com/" "Mozilla/4.08"
        let combined_regex = Regex::new(
            r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "([^"]*)" (\S+) (\S+) "([^"]*)" "([^"]*)"\s*$"#,
        )
        .context("Failed to compile Combined Log Format regex")?;

        // Common Log Format (no referer, no user agent)
        // Example: 192.168.1.1 - user [25/Dec/1995:10:00:00 +0000] "GET /index.html HTTP/1.0" 200 1234
        let common_regex =
            Regex::new(r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "([^"]*)" (\S+) (\S+)\s*$"#)
                .context("Failed to compile Common Log Format regex")?;

        Ok(Self {
            combined_with_request_time_regex,
            combined_regex,
            common_regex,
        })
    }

    /// Fields shared by all three grammars: ip, identity, user, time, request, status, bytes
    fn common_fields(captures: &Captures<'_>) -> StructuredRecord {
        let mut record = StructuredRecord::default();

        if let Some(ip) = captures.get(1) {
            record.remote_addr = Some(ip.as_str().to_string());
        }

        // Groups 2 and 3 (identity and remote user) are not carried further

        if let Some(time) = captures.get(4) {
            record.time_local = Some(time.as_str().to_string());
        }

        if let Some(request) = captures.get(5) {
            record.apply_request_line(request.as_str());
        }

        if let Some(status) = captures.get(6) {
            record.set_status_text(status.as_str());
        }

        if let Some(bytes) = captures.get(7) {
            record.set_body_size_text(bytes.as_str());
        }

        record
    }

    fn try_parse_combined_with_request_time(&self, line: &str) -> Option<StructuredRecord> {
        let captures = self.combined_with_request_time_regex.captures(line)?;
        let mut record = Self::common_fields(&captures);

        if let Some(referer) = captures.get(8) {
            record.set_referer(referer.as_str());
        }
        if let Some(user_agent) = captures.get(9) {
            record.set_user_agent(user_agent.as_str());
        }
        if let Some(request_time) = captures.get(10) {
            record.request_time = request_time.as_str().parse::<f64>().ok();
        }

        Some(record.finish())
    }

    fn try_parse_combined(&self, line: &str) -> Option<StructuredRecord> {
        let captures = self.combined_regex.captures(line)?;
        let mut record = Self::common_fields(&captures);

        if let Some(referer) = captures.get(8) {
            record.set_referer(referer.as_str());
        }
        if let Some(user_agent) = captures.get(9) {
            record.set_user_agent(user_agent.as_str());
        }

        Some(record.finish())
    }

    fn try_parse_common(&self, line: &str) -> Option<StructuredRecord> {
        let captures = self.common_regex.captures(line)?;
        Some(Self::common_fields(&captures).finish())
    }
}

impl RecordParser for CombinedParser {
    fn name(&self) -> &'static str {
        "combined"
    }

    fn parse(&self, line: &str) -> Option<StructuredRecord> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        self.try_parse_combined_with_request_time(line)
            .or_else(|| self.try_parse_combined(line))
            .or_else(|| self.try_parse_common(line))
    }
}
