//! Projection of message context onto trace spans and baggage.
//!
//! # Responsibilities
//! - Tag the active span with well-known context attributes
//! - Route tenant/user and custom items through the sanitizer
//! - Link to the parent parsed from the context's trace-parent
//! - Mirror context fields into and out of a baggage carrier
//!
//! # Design Decisions
//! - Absent span or context is a no-op, not an error
//! - A sanitizer returning `None` omits the field everywhere

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::EnricherConfig;
use crate::context::message::item_to_string;
use crate::context::{fields, MessageContext};
use crate::error::{require_arg, ContextFlowResult};
use crate::observability::sanitizer::TagSanitizer;
use crate::observability::tracing::{ActiveSpan, AttributeValue, EventAttributes, TraceParent};

pub const ATTR_MESSAGE_ID: &str = "message.id";
pub const ATTR_CORRELATION_ID: &str = "message.correlation_id";
pub const ATTR_CAUSATION_ID: &str = "message.causation_id";
pub const ATTR_MESSAGE_TYPE: &str = "message.type";
pub const ATTR_SOURCE: &str = "message.source";
pub const ATTR_DELIVERY_COUNT: &str = "message.delivery_count";
pub const ATTR_TENANT_ID: &str = "message.tenant_id";
pub const ATTR_USER_ID: &str = "message.user_id";
pub const ATTR_ITEM_PREFIX: &str = "message.item.";

pub const BAGGAGE_MESSAGE_ID: &str = "context.message_id";
pub const BAGGAGE_CORRELATION_ID: &str = "context.correlation_id";
pub const BAGGAGE_CAUSATION_ID: &str = "context.causation_id";
pub const BAGGAGE_MESSAGE_TYPE: &str = "context.message_type";
pub const BAGGAGE_TENANT_ID: &str = "context.tenant_id";
pub const BAGGAGE_USER_ID: &str = "context.user_id";

/// A string-keyed baggage carrier.
pub trait BaggageCarrier {
    fn set(&mut self, key: &str, value: String);
    fn get(&self, key: &str) -> Option<&str>;
}

impl BaggageCarrier for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl BaggageCarrier for BTreeMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }
}

/// Writes context onto spans and baggage.
#[derive(Clone)]
pub struct ContextTraceEnricher {
    config: EnricherConfig,
    sanitizer: Arc<dyn TagSanitizer>,
}

impl ContextTraceEnricher {
    pub fn new(config: EnricherConfig, sanitizer: Arc<dyn TagSanitizer>) -> Self {
        Self { config, sanitizer }
    }

    /// Tag `span` with the context's attributes.
    pub fn enrich_span(&self, span: Option<&dyn ActiveSpan>, context: Option<&MessageContext>) {
        let (Some(span), Some(context)) = (span, context) else {
            return;
        };
        if !span.is_recording() {
            return;
        }

        let plain = [
            (ATTR_MESSAGE_ID, &context.message_id),
            (ATTR_CORRELATION_ID, &context.correlation_id),
            (ATTR_CAUSATION_ID, &context.causation_id),
            (ATTR_MESSAGE_TYPE, &context.message_type),
            (ATTR_SOURCE, &context.source),
        ];
        for (key, value) in plain {
            if let Some(value) = value {
                span.set_attribute(key, AttributeValue::from(value.as_str()));
            }
        }
        span.set_attribute(ATTR_DELIVERY_COUNT, AttributeValue::Int(context.delivery_count as i64));

        let sensitive = [
            (ATTR_TENANT_ID, fields::TENANT_ID, &context.tenant_id),
            (ATTR_USER_ID, fields::USER_ID, &context.user_id),
        ];
        for (key, field, value) in sensitive {
            if let Some(value) = self.sanitized(field, value.as_deref()) {
                span.set_attribute(key, AttributeValue::String(value));
            }
        }

        if self.config.include_custom_items {
            for (name, value) in context.custom_items().take(self.config.max_custom_items) {
                let Some(raw) = item_to_string(value) else {
                    continue;
                };
                if let Some(clean) = self.sanitizer.sanitize_tag(name, &raw) {
                    span.set_attribute(&format!("{}{}", ATTR_ITEM_PREFIX, name), AttributeValue::String(clean));
                }
            }
        }

        if self.config.link_parent_trace {
            if let Some(parent) = context.trace_parent.as_deref().and_then(TraceParent::parse) {
                span.add_link(&parent.trace_id, &parent.span_id);
            } else if context.trace_parent.is_some() {
                tracing::debug!(message_id = ?context.message_id, "Ignoring malformed trace parent");
            }
        }
    }

    /// Record a named event on `span` carrying the context ids.
    pub fn add_context_event(
        &self,
        span: Option<&dyn ActiveSpan>,
        event_name: &str,
        context: &MessageContext,
        mut attributes: EventAttributes,
    ) -> ContextFlowResult<()> {
        require_arg(event_name, "event_name")?;
        let Some(span) = span else {
            return Ok(());
        };

        if let Some(id) = &context.message_id {
            attributes.push((ATTR_MESSAGE_ID.to_string(), id.as_str().into()));
        }
        if let Some(id) = &context.correlation_id {
            attributes.push((ATTR_CORRELATION_ID.to_string(), id.as_str().into()));
        }
        span.add_event(event_name, attributes);
        Ok(())
    }

    /// Write context fields into `carrier`; omitted fields are not written.
    pub fn propagate_context_as_baggage<C: BaggageCarrier + ?Sized>(
        &self,
        context: Option<&MessageContext>,
        carrier: &mut C,
    ) {
        let Some(context) = context else {
            return;
        };

        let plain = [
            (BAGGAGE_MESSAGE_ID, &context.message_id),
            (BAGGAGE_CORRELATION_ID, &context.correlation_id),
            (BAGGAGE_CAUSATION_ID, &context.causation_id),
            (BAGGAGE_MESSAGE_TYPE, &context.message_type),
        ];
        for (key, value) in plain {
            if let Some(value) = value {
                carrier.set(key, value.clone());
            }
        }

        if let Some(tenant) = self.sanitized(fields::TENANT_ID, context.tenant_id.as_deref()) {
            carrier.set(BAGGAGE_TENANT_ID, tenant);
        }
        if let Some(user) = self.sanitized(fields::USER_ID, context.user_id.as_deref()) {
            carrier.set(BAGGAGE_USER_ID, user);
        }
    }

    /// Fill `context` from `carrier`, returning how many fields were read.
    pub fn extract_context_from_baggage<C: BaggageCarrier + ?Sized>(
        &self,
        carrier: &C,
        context: &mut MessageContext,
    ) -> usize {
        let mut read = 0;
        let mut take = |key: &str, slot: &mut Option<String>| {
            if let Some(value) = carrier.get(key).filter(|v| !v.is_empty()) {
                *slot = Some(value.to_string());
                read += 1;
            }
        };
        take(BAGGAGE_MESSAGE_ID, &mut context.message_id);
        take(BAGGAGE_CORRELATION_ID, &mut context.correlation_id);
        take(BAGGAGE_CAUSATION_ID, &mut context.causation_id);
        take(BAGGAGE_MESSAGE_TYPE, &mut context.message_type);

        if let Some(tenant) = self.sanitized(fields::TENANT_ID, carrier.get(BAGGAGE_TENANT_ID)) {
            context.tenant_id = Some(tenant);
            read += 1;
        }
        if let Some(user) = self.sanitized(fields::USER_ID, carrier.get(BAGGAGE_USER_ID)) {
            context.user_id = Some(user);
            read += 1;
        }
        read
    }

    /// Create a span for a named engine operation, tagged with the context ids.
    pub fn start_operation_span(&self, operation: &str, context: &MessageContext) -> tracing::Span {
        tracing::info_span!(
            "context_flow.operation",
            operation = operation,
            message_id = context.message_id.as_deref().unwrap_or_default(),
            correlation_id = context.correlation_id.as_deref().unwrap_or_default(),
            message_type = context.message_type.as_deref().unwrap_or_default(),
        )
    }

    fn sanitized(&self, field: &str, value: Option<&str>) -> Option<String> {
        let value = value.filter(|v| !v.is_empty())?;
        self.sanitizer.sanitize_tag(field, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::sanitizer::{PassthroughSanitizer, RedactingSanitizer, REDACTED};
    use crate::observability::tracing::RecordingSpan;

    const TRACE_PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn context() -> MessageContext {
        MessageContext::new("m-1")
            .with_correlation_id("c-1")
            .with_message_type("OrderPlaced")
            .with_tenant_id("tenant-a")
            .with_user_id("user-7")
            .with_item("Region", "eu")
            .with_item("CustomerEmail", "a@b.c")
    }

    fn enricher(config: EnricherConfig, sanitizer: Arc<dyn TagSanitizer>) -> ContextTraceEnricher {
        ContextTraceEnricher::new(config, sanitizer)
    }

    #[test]
    fn test_enrich_span_sets_well_known_attributes() {
        let span = RecordingSpan::new();
        let e = enricher(EnricherConfig::default(), Arc::new(PassthroughSanitizer));
        e.enrich_span(Some(&span), Some(&context()));

        assert_eq!(span.attribute(ATTR_MESSAGE_ID), Some("m-1".into()));
        assert_eq!(span.attribute(ATTR_CORRELATION_ID), Some("c-1".into()));
        assert_eq!(span.attribute(ATTR_TENANT_ID), Some("tenant-a".into()));
        assert_eq!(span.attribute(ATTR_DELIVERY_COUNT), Some(AttributeValue::Int(1)));
        assert!(span.attribute("message.item.Region").is_none());
    }

    #[test]
    fn test_sanitizer_can_omit_user() {
        let span = RecordingSpan::new();
        let sanitizer = RedactingSanitizer::new(["email"]).deny(["UserId"]);
        let config = EnricherConfig {
            include_custom_items: true,
            ..EnricherConfig::default()
        };
        enricher(config, Arc::new(sanitizer)).enrich_span(Some(&span), Some(&context()));

        assert!(span.attribute(ATTR_USER_ID).is_none());
        assert_eq!(span.attribute("message.item.Region"), Some("eu".into()));
        assert_eq!(span.attribute("message.item.CustomerEmail"), Some(REDACTED.into()));
    }

    #[test]
    fn test_parent_link_and_malformed_skip() {
        let e = enricher(EnricherConfig::default(), Arc::new(PassthroughSanitizer));

        let span = RecordingSpan::new();
        e.enrich_span(Some(&span), Some(&context().with_trace_parent(TRACE_PARENT)));
        assert_eq!(
            span.links(),
            vec![("4bf92f3577b34da6a3ce929d0e0e4736".to_string(), "00f067aa0ba902b7".to_string())]
        );

        let span = RecordingSpan::new();
        e.enrich_span(Some(&span), Some(&context().with_trace_parent("not-a-traceparent")));
        assert!(span.links().is_empty());
    }

    #[test]
    fn test_absent_span_or_context_is_noop() {
        let e = enricher(EnricherConfig::default(), Arc::new(PassthroughSanitizer));
        e.enrich_span(None, Some(&context()));
        let span = RecordingSpan::new();
        e.enrich_span(Some(&span), None);
        assert!(span.attributes().is_empty());
        assert!(e.add_context_event(None, "context.checked", &context(), Vec::new()).is_ok());
    }

    #[test]
    fn test_add_context_event_requires_name() {
        let e = enricher(EnricherConfig::default(), Arc::new(PassthroughSanitizer));
        let span = RecordingSpan::new();
        assert!(e.add_context_event(Some(&span), " ", &context(), Vec::new()).is_err());

        e.add_context_event(Some(&span), "context.checked", &context(), Vec::new()).unwrap();
        let events = span.events();
        assert_eq!(events[0].0, "context.checked");
        assert_eq!(events[0].1.len(), 2);
    }

    #[test]
    fn test_baggage_round_trip_with_sanitizer() {
        let sanitizer = RedactingSanitizer::new(Vec::<String>::new()).deny(["UserId"]);
        let e = enricher(EnricherConfig::default(), Arc::new(sanitizer));

        let mut carrier: HashMap<String, String> = HashMap::new();
        e.propagate_context_as_baggage(Some(&context()), &mut carrier);
        assert_eq!(carrier.get(BAGGAGE_CORRELATION_ID).map(String::as_str), Some("c-1"));
        assert!(!carrier.contains_key(BAGGAGE_USER_ID));

        let mut restored = MessageContext::default();
        let read = e.extract_context_from_baggage(&carrier, &mut restored);
        assert_eq!(read, 4);
        assert_eq!(restored.message_id.as_deref(), Some("m-1"));
        assert_eq!(restored.tenant_id.as_deref(), Some("tenant-a"));
        assert!(restored.user_id.is_none());
    }
}
