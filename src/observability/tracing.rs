//! Distributed tracing support.
//!
//! # Responsibilities
//! - Abstract the "active span" the enricher writes to
//! - Adapt `tracing::Span` to that abstraction
//! - Parse W3C trace-parent values for parent links
//!
//! # Design Decisions
//! - The engine never creates spans except through the operation-span helper
//! - Malformed trace-parent values parse to `None`, never an error

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// A span attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// An event attribute list.
pub type EventAttributes = Vec<(String, AttributeValue)>;

/// Capability surface of an active trace span.
pub trait ActiveSpan: Send + Sync {
    fn set_attribute(&self, key: &str, value: AttributeValue);

    fn add_event(&self, name: &str, attributes: EventAttributes);

    /// Link this span to a remote parent.
    fn add_link(&self, trace_id: &str, span_id: &str);

    fn is_recording(&self) -> bool {
        true
    }
}

/// Adapter writing span operations as events inside a `tracing::Span`.
#[derive(Debug, Clone)]
pub struct TracingSpan {
    span: tracing::Span,
}

impl TracingSpan {
    pub fn new(span: tracing::Span) -> Self {
        Self { span }
    }

    /// Wrap the span the current task is executing in.
    pub fn current() -> Self {
        Self::new(tracing::Span::current())
    }

    pub fn inner(&self) -> &tracing::Span {
        &self.span
    }
}

impl ActiveSpan for TracingSpan {
    fn set_attribute(&self, key: &str, value: AttributeValue) {
        tracing::trace!(parent: &self.span, attribute.key = key, attribute.value = %value, "span attribute");
    }

    fn add_event(&self, name: &str, attributes: EventAttributes) {
        tracing::info!(parent: &self.span, event = name, attributes = ?attributes, "span event");
    }

    fn add_link(&self, trace_id: &str, span_id: &str) {
        tracing::debug!(parent: &self.span, link.trace_id = trace_id, link.span_id = span_id, "span link");
    }

    fn is_recording(&self) -> bool {
        !self.span.is_disabled()
    }
}

/// In-memory span that keeps everything written to it.
#[derive(Debug, Default)]
pub struct RecordingSpan {
    attributes: Mutex<BTreeMap<String, AttributeValue>>,
    events: Mutex<Vec<(String, EventAttributes)>>,
    links: Mutex<Vec<(String, String)>>,
}

impl RecordingSpan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn events(&self) -> Vec<(String, EventAttributes)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|(name, _)| name).collect()
    }

    pub fn links(&self) -> Vec<(String, String)> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ActiveSpan for RecordingSpan {
    fn set_attribute(&self, key: &str, value: AttributeValue) {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }

    fn add_event(&self, name: &str, attributes: EventAttributes) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), attributes));
    }

    fn add_link(&self, trace_id: &str, span_id: &str) {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((trace_id.to_string(), span_id.to_string()));
    }
}

/// Parsed W3C `traceparent` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub version: String,
    pub trace_id: String,
    pub span_id: String,
    pub flags: String,
}

impl TraceParent {
    /// Parse `version-traceid-spanid-flags`; `None` on any malformed part.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let valid = is_hex(version, 2)
            && version != "ff"
            && is_hex(trace_id, 32)
            && !is_all_zero(trace_id)
            && is_hex(span_id, 16)
            && !is_all_zero(span_id)
            && is_hex(flags, 2);
        if !valid {
            return None;
        }

        Some(Self {
            version: version.to_string(),
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags: flags.to_string(),
        })
    }

    pub fn is_sampled(&self) -> bool {
        u8::from_str_radix(&self.flags, 16).is_ok_and(|f| f & 0x01 == 0x01)
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_all_zero(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}
