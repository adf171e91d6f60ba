//! Tag sanitization for span attributes and baggage.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

/// Decides what a potentially sensitive value looks like once it leaves the process.
pub trait TagSanitizer: Send + Sync {
    /// Return the value to write, or `None` to omit the field entirely.
    fn sanitize_tag(&self, name: &str, value: &str) -> Option<String>;
}

/// Writes every value unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSanitizer;

impl TagSanitizer for PassthroughSanitizer {
    fn sanitize_tag(&self, _name: &str, value: &str) -> Option<String> {
        Some(value.to_string())
    }
}

/// Placeholder written in place of redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Redacts values of sensitive-looking fields and omits denied ones.
#[derive(Debug, Clone)]
pub struct RedactingSanitizer {
    patterns: Vec<Regex>,
    denied: HashSet<String>,
}

impl RedactingSanitizer {
    /// Build from case-insensitive name patterns; invalid patterns are skipped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: compile_patterns(patterns),
            denied: HashSet::new(),
        }
    }

    /// Fields named here are never written.
    pub fn deny<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied
            .extend(names.into_iter().map(|n| n.into().to_ascii_lowercase()));
        self
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

impl TagSanitizer for RedactingSanitizer {
    fn sanitize_tag(&self, name: &str, value: &str) -> Option<String> {
        if self.denied.contains(&name.to_ascii_lowercase()) {
            return None;
        }
        if self.is_sensitive(name) {
            return Some(REDACTED.to_string());
        }
        Some(value.to_string())
    }
}

/// Compile case-insensitive patterns, logging and skipping invalid ones.
pub(crate) fn compile_patterns<I, S>(patterns: I) -> Vec<Regex>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .filter_map(|p| {
            match RegexBuilder::new(p.as_ref()).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = p.as_ref(), error = %e, "Skipping invalid sensitive pattern");
                    None
                }
            }
        })
        .collect()
}
