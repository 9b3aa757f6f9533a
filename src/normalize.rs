use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

/// Where a rule is allowed to match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Anywhere the regex matches
    Anywhere,
    /// Only a whole path segment or parameter value of `min..=max` digits:
    /// preceded by `/` or `=`, followed by a segment terminator or end of input
    Segment { min: usize, max: usize },
}

#[derive(Debug)]
struct Rule {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
    scope: Scope,
}

/// Rules are compiled without Unicode: `\d`, `\b` and `(?i)` cover ASCII only,
/// the same alphabet the token classes use.
fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?-u){}", pattern)).unwrap()
}

fn rule(name: &'static str, pattern: &str, replacement: &'static str) -> Rule {
    Rule {
        name,
        regex: compile(pattern),
        replacement,
        scope: Scope::Anywhere,
    }
}

fn segment_rule(name: &'static str, min: usize, max: usize, replacement: &'static str) -> Rule {
    Rule {
        name,
        regex: compile(r"[/=]([0-9]+)"),
        replacement,
        scope: Scope::Segment { min, max },
    }
}

/// Ordered substitution table. Specific identifiers and timestamps run before
/// the generic integer rules so they are not masked piecemeal.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(
            "uuid",
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<UUID>",
        ),
        rule(
            "jsessionid",
            r"(?i)JSESSIONID=[A-F0-9]{32}\b",
            "JSESSIONID=<SESSION>",
        ),
        rule(
            "sessionid",
            r"(?i)\bsessionid=[a-z0-9]{20,40}\b",
            "sessionid=<SESSION>",
        ),
        rule("hash", r"(?i)\b[a-f0-9]{32,}\b", "<HASH>"),
        rule(
            "iso_timestamp",
            r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\b",
            "<TIMESTAMP>",
        ),
        rule("epoch_timestamp", r"\b\d{10,13}\b", "<TIMESTAMP>"),
        segment_rule("large_int", 4, usize::MAX, "<ID>"),
        segment_rule("small_int", 1, 3, "<NUM>"),
        rule(
            "email",
            r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b",
            "<EMAIL>",
        ),
        rule("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "<IP>"),
        rule(
            "csrf_token",
            r"csrf_token=[a-zA-Z0-9+/=]{20,}",
            "csrf_token=<CSRF>",
        ),
    ]
});

fn ends_segment(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => matches!(c, '/' | '?' | '&' | ';' | ',') || c.is_whitespace(),
    }
}

fn replace_segments(regex: &Regex, text: &str, min: usize, max: usize, replacement: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;

    for captures in regex.captures_iter(text) {
        let Some(digits) = captures.get(1) else {
            continue;
        };
        let len = digits.as_str().len();
        if len < min || len > max || !ends_segment(text[digits.end()..].chars().next()) {
            continue;
        }
        output.push_str(&text[last..digits.start()]);
        output.push_str(replacement);
        last = digits.end();
    }

    output.push_str(&text[last..]);
    output
}

impl Rule {
    fn apply(&self, text: &str) -> String {
        match self.scope {
            Scope::Anywhere => self
                .regex
                .replace_all(text, NoExpand(self.replacement))
                .into_owned(),
            Scope::Segment { min, max } => {
                replace_segments(&self.regex, text, min, max, self.replacement)
            }
        }
    }
}

/// Replace volatile values (ids, timestamps, tokens, addresses) with fixed placeholders.
///
/// Placeholders never match any rule, so `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(text: &str) -> String {
    RULES
        .iter()
        .fold(text.to_string(), |current, rule| rule.apply(&current))
}

/// Names of the rules in the order they run
pub fn rule_names() -> Vec<&'static str> {
    RULES.iter().map(|rule| rule.name).collect()
}
