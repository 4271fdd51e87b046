//! Permission patterns
//!
//! Each endpoint carries a block of permission lines, one per line, in the
//! form `pub=GLOB` or `sub=GLOB`. Globs are dot-separated: `*` matches a
//! single level (anything but a dot), `**` matches any depth. Globs compile
//! to anchored, case-insensitive regexes held in a process-wide cache so the
//! same glob is compiled once no matter how many endpoints use it.
//!
//! Evaluation is fail-closed: an unknown endpoint, an endpoint with no
//! patterns for the requested operation, or a topic no pattern matches are
//! all denials. Malformed lines are logged and skipped, they never make an
//! endpoint's registration fail.

use bytestring::ByteString;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::types::{DashMap, EndpointId, Operation};

static REGEX_CACHE: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::default);

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Allowed, with the pattern text that matched.
    Allowed { pattern: ByteString },
    Denied { reason: &'static str },
}

impl Evaluation {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Evaluation::Allowed { .. })
    }

    #[inline]
    pub fn pattern(&self) -> Option<&ByteString> {
        match self {
            Evaluation::Allowed { pattern } => Some(pattern),
            Evaluation::Denied { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ParsedPattern {
    op: Operation,
    text: ByteString,
    regex: Regex,
    is_exact: bool,
}

pub struct PatternMatcher {
    by_endpoint: DashMap<EndpointId, Vec<ParsedPattern>>,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    #[inline]
    pub fn new() -> Self {
        Self { by_endpoint: DashMap::default() }
    }

    /// Register (or replace) an endpoint's permission lines. Lines that are
    /// empty or that do not parse as `pub=...`/`sub=...` are skipped with a
    /// warning.
    pub fn add(&self, endpoint_id: EndpointId, topic_patterns: &str) {
        let mut parsed = Vec::new();
        for line in topic_patterns.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (op, glob) = match line.split_once('=') {
                Some(("pub", glob)) => (Operation::Publish, glob.trim()),
                Some(("sub", glob)) => (Operation::Subscribe, glob.trim()),
                _ => {
                    log::warn!("endpoint `{}`, skipping malformed pattern line `{}`", endpoint_id, line);
                    continue;
                }
            };
            if glob.is_empty() {
                log::warn!("endpoint `{}`, skipping empty pattern line `{}`", endpoint_id, line);
                continue;
            }
            match compile_glob(glob) {
                Ok(regex) => parsed.push(ParsedPattern {
                    op,
                    text: ByteString::from(glob.to_owned()),
                    regex,
                    is_exact: !glob.contains('*'),
                }),
                Err(e) => {
                    log::warn!("endpoint `{}`, unusable pattern `{}`, {:?}", endpoint_id, glob, e);
                }
            }
        }
        // Exact patterns are checked before wildcard ones.
        parsed.sort_by(|a, b| b.is_exact.cmp(&a.is_exact).then_with(|| a.text.cmp(&b.text)));
        self.by_endpoint.insert(endpoint_id, parsed);
    }

    #[inline]
    pub fn remove(&self, endpoint_id: EndpointId) {
        self.by_endpoint.remove(&endpoint_id);
    }

    #[inline]
    pub fn contains(&self, endpoint_id: EndpointId) -> bool {
        self.by_endpoint.contains_key(&endpoint_id)
    }

    /// Check whether `endpoint_id` may perform `op` against `topic`.
    pub fn evaluate(&self, endpoint_id: EndpointId, topic: &str, op: Operation) -> Evaluation {
        let patterns = match self.by_endpoint.get(&endpoint_id) {
            Some(p) => p,
            None => return Evaluation::Denied { reason: "unknown endpoint" },
        };
        let mut seen_op = false;
        for p in patterns.iter().filter(|p| p.op == op) {
            seen_op = true;
            if p.regex.is_match(topic) {
                return Evaluation::Allowed { pattern: p.text.clone() };
            }
        }
        if seen_op {
            Evaluation::Denied { reason: "no matching pattern" }
        } else {
            Evaluation::Denied { reason: "operation not granted" }
        }
    }
}

/// Compile a topic glob to an anchored case-insensitive regex, via the
/// process-wide cache.
fn compile_glob(glob: &str) -> anyhow::Result<Regex> {
    if let Some(re) = REGEX_CACHE.get(glob) {
        return Ok(re.clone());
    }
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^.]*");
                }
            }
            c if regex_syntax_char(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    let re = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
    REGEX_CACHE.insert(glob.to_owned(), re.clone());
    Ok(re)
}

#[inline]
fn regex_syntax_char(c: char) -> bool {
    matches!(c, '.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let m = PatternMatcher::new();
        m.add(1, "pub=orders.processed");
        assert!(m.evaluate(1, "orders.processed", Operation::Publish).is_allowed());
        assert!(!m.evaluate(1, "orders.rejected", Operation::Publish).is_allowed());
    }

    #[test]
    fn single_level_wildcard_stops_at_dot() {
        let m = PatternMatcher::new();
        m.add(1, "sub=orders.*");
        assert!(m.evaluate(1, "orders.processed", Operation::Subscribe).is_allowed());
        assert!(!m.evaluate(1, "orders.eu.processed", Operation::Subscribe).is_allowed());
    }

    #[test]
    fn double_wildcard_matches_any_depth() {
        let m = PatternMatcher::new();
        m.add(1, "sub=orders.**");
        assert!(m.evaluate(1, "orders.eu.processed", Operation::Subscribe).is_allowed());
        assert!(m.evaluate(1, "orders.x", Operation::Subscribe).is_allowed());
        assert!(!m.evaluate(1, "invoices.x", Operation::Subscribe).is_allowed());
    }

    #[test]
    fn pub_and_sub_are_separate_grants() {
        let m = PatternMatcher::new();
        m.add(1, "pub=orders.**\nsub=invoices.**");
        assert!(m.evaluate(1, "orders.new", Operation::Publish).is_allowed());
        assert!(!m.evaluate(1, "orders.new", Operation::Subscribe).is_allowed());
        assert!(m.evaluate(1, "invoices.new", Operation::Subscribe).is_allowed());
    }

    #[test]
    fn fail_closed() {
        let m = PatternMatcher::new();
        assert_eq!(
            m.evaluate(42, "orders.new", Operation::Publish),
            Evaluation::Denied { reason: "unknown endpoint" }
        );
        m.add(42, "");
        assert!(!m.evaluate(42, "orders.new", Operation::Publish).is_allowed());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let m = PatternMatcher::new();
        m.add(1, "pub=orders.**\nnonsense\nfoo=bar\nsub=");
        assert!(m.evaluate(1, "orders.new", Operation::Publish).is_allowed());
        assert!(!m.evaluate(1, "nonsense", Operation::Publish).is_allowed());
        assert!(!m.evaluate(1, "bar", Operation::Subscribe).is_allowed());
    }

    #[test]
    fn exact_patterns_take_precedence() {
        let m = PatternMatcher::new();
        m.add(1, "sub=orders.*\nsub=orders.processed");
        let ev = m.evaluate(1, "orders.processed", Operation::Subscribe);
        assert_eq!(ev.pattern().map(|p| &**p), Some("orders.processed"));
    }

    #[test]
    fn case_insensitive() {
        let m = PatternMatcher::new();
        m.add(1, "pub=Orders.**");
        assert!(m.evaluate(1, "orders.NEW", Operation::Publish).is_allowed());
    }

    #[test]
    fn replace_patterns() {
        let m = PatternMatcher::new();
        m.add(1, "pub=orders.**");
        m.add(1, "pub=invoices.**");
        assert!(!m.evaluate(1, "orders.new", Operation::Publish).is_allowed());
        assert!(m.evaluate(1, "invoices.new", Operation::Publish).is_allowed());
        m.remove(1);
        assert!(!m.evaluate(1, "invoices.new", Operation::Publish).is_allowed());
    }
}
