//! Access-log grammars.
//!
//! `LineParser` tries each grammar in order and returns the first record it
//! gets back. Grammars never fail hard: a field they cannot coerce is left at
//! its default and only a line no grammar accepts is rejected.

pub mod combined;
pub mod json;

pub use combined::CombinedParser;
pub use json::JsonParser;

use crate::error_handling::ParseFailure;
use crate::record::StructuredRecord;
use anyhow::Result;

/// One log grammar. `None` means "not my format", never an error.
pub trait RecordParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, line: &str) -> Option<StructuredRecord>;
}

const MAX_ERROR_LINE_LEN: usize = 80;

pub struct LineParser {
    grammars: Vec<Box<dyn RecordParser>>,
}

impl LineParser {
    /// Web-log grammars first, JSON objects as the generic fallback
    pub fn new() -> Result<Self> {
        Ok(Self::with_grammars(vec![
            Box::new(CombinedParser::new()?),
            Box::new(JsonParser::new()),
        ]))
    }

    pub fn with_grammars(grammars: Vec<Box<dyn RecordParser>>) -> Self {
        Self { grammars }
    }

    pub fn grammar_names(&self) -> Vec<&'static str> {
        self.grammars.iter().map(|g| g.name()).collect()
    }

    pub fn parse(&self, line: &str) -> Result<StructuredRecord, ParseFailure> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ParseFailure::Empty);
        }

        self.grammars
            .iter()
            .find_map(|grammar| grammar.parse(line))
            .ok_or_else(|| ParseFailure::UnrecognizedFormat(truncate_for_error(line)))
    }
}

fn truncate_for_error(line: &str) -> String {
    if line.chars().count() <= MAX_ERROR_LINE_LEN {
        return line.to_string();
    }
    let mut truncated: String = line.chars().take(MAX_ERROR_LINE_LEN).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tries_grammars_in_order() {
        let parser = LineParser::new().unwrap();
        assert_eq!(parser.grammar_names(), vec!["combined", "json"]);

        let combined = parser
            .parse(r#"127.0.0.1 - - [23/Sep/2025:10:30:00 +0000] "GET /blog-cms/posts/123 HTTP/1.1" 200 1234 "-" "Mozilla/5.0""#)
            .unwrap();
        assert_eq!(combined.path_only, "/blog-cms/posts/123");

        let json = parser.parse(r#"{"method":"GET","path":"/x"}"#).unwrap();
        assert_eq!(json.path_only, "/x");
    }

    #[test]
    fn rejects_blank_and_unknown_lines() {
        let parser = LineParser::new().unwrap();
        assert_eq!(parser.parse("   \n"), Err(ParseFailure::Empty));
        assert!(matches!(
            parser.parse("kernel: eth0 link up"),
            Err(ParseFailure::UnrecognizedFormat(_))
        ));
    }

    #[test]
    fn long_lines_are_truncated_in_errors() {
        let parser = LineParser::new().unwrap();
        let line = "x".repeat(500);
        match parser.parse(&line) {
            Err(ParseFailure::UnrecognizedFormat(shown)) => {
                assert_eq!(shown.len(), MAX_ERROR_LINE_LEN + 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
