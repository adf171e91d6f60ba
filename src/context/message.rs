//! The message context observed by the engine.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Prefix shared by every item key the engine reserves for itself.
pub const RESERVED_PREFIX: &str = "ContextFlow.";

/// Item holding the pipeline-supplied stage name.
pub const STAGE_ITEM_KEY: &str = "ContextFlow.Stage";

/// Item holding persisted mutation history.
pub const MUTATIONS_ITEM_KEY: &str = "ContextFlow.Mutations";

/// Item holding an externally attached validation result.
pub const VALIDATION_RESULT_KEY: &str = "ContextFlow.ValidationResult";

/// Item holding an externally attached authorization result.
pub const AUTHORIZATION_RESULT_KEY: &str = "ContextFlow.AuthorizationResult";

/// Well-known field names, in snapshot order.
pub mod fields {
    pub const MESSAGE_ID: &str = "MessageId";
    pub const CORRELATION_ID: &str = "CorrelationId";
    pub const CAUSATION_ID: &str = "CausationId";
    pub const MESSAGE_TYPE: &str = "MessageType";
    pub const TENANT_ID: &str = "TenantId";
    pub const USER_ID: &str = "UserId";
    pub const SOURCE: &str = "Source";
    pub const SENT_AT: &str = "SentAt";
    pub const DELIVERY_COUNT: &str = "DeliveryCount";
    pub const TRACE_PARENT: &str = "TraceParent";

    pub const ALL: [&str; 10] = [
        MESSAGE_ID,
        CORRELATION_ID,
        CAUSATION_ID,
        MESSAGE_TYPE,
        TENANT_ID,
        USER_ID,
        SOURCE,
        SENT_AT,
        DELIVERY_COUNT,
        TRACE_PARENT,
    ];

    /// Prefix applied to custom items inside a snapshot.
    pub const ITEM_PREFIX: &str = "Item.";
}

/// Contextual state carried alongside a dispatched message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub message_type: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub trace_parent: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivery_count: u32,
    /// Free-form custom items.
    #[serde(default)]
    pub items: BTreeMap<String, Value>,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            causation_id: None,
            message_type: None,
            tenant_id: None,
            user_id: None,
            source: None,
            trace_parent: None,
            sent_at: None,
            delivery_count: 1,
            items: BTreeMap::new(),
        }
    }
}

impl MessageContext {
    /// Create a context for the given message id.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_user_id(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.trace_parent = Some(trace_parent.into());
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = count;
        self
    }

    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.items.insert(key.into(), value.into());
        self
    }

    /// Set or replace a custom item.
    pub fn set_item(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.items.insert(key.into(), value.into());
    }

    pub fn item(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    /// Look up an optional typed capability stored under a reserved key.
    ///
    /// Returns `None` when the item is absent or does not deserialize into `T`.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.items.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Custom items the caller owns, excluding engine-reserved keys.
    pub fn custom_items(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.items
            .iter()
            .filter(|(key, _)| !key.starts_with(RESERVED_PREFIX))
    }

    /// Resolve a well-known attribute by field name.
    ///
    /// Returns `None` for unknown names, `Some(None)` for known-but-unset.
    pub fn well_known(&self, name: &str) -> Option<Option<String>> {
        let value = match name {
            fields::MESSAGE_ID => self.message_id.clone(),
            fields::CORRELATION_ID => self.correlation_id.clone(),
            fields::CAUSATION_ID => self.causation_id.clone(),
            fields::MESSAGE_TYPE => self.message_type.clone(),
            fields::TENANT_ID => self.tenant_id.clone(),
            fields::USER_ID => self.user_id.clone(),
            fields::SOURCE => self.source.clone(),
            fields::TRACE_PARENT => self.trace_parent.clone(),
            fields::SENT_AT => self.sent_at.map(|t| t.to_rfc3339()),
            fields::DELIVERY_COUNT => Some(self.delivery_count.to_string()),
            _ => return None,
        };
        Some(value)
    }

    /// Resolve a field by name: well-known attributes first, then custom items.
    pub fn resolve_field(&self, name: &str) -> Option<String> {
        if let Some(value) = self.well_known(name) {
            return value;
        }
        self.items.get(name).and_then(item_to_string)
    }

    /// Count well-known attributes and custom items that carry a value.
    pub fn populated_field_count(&self) -> usize {
        let well_known = fields::ALL
            .iter()
            .filter(|name| {
                self.well_known(name)
                    .flatten()
                    .is_some_and(|v| !v.trim().is_empty())
            })
            .count();
        let custom = self.custom_items().filter(|(_, v)| !v.is_null()).count();
        well_known + custom
    }

    /// Key used to group this context into a lineage.
    pub fn lineage_key(&self) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or(self.message_id.as_deref())
    }
}

/// Render a custom item as a snapshot value.
pub(crate) fn item_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Outcome of an external validation step attached to a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Outcome of an external authorization step attached to a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub is_authorized: bool,
    #[serde(default)]
    pub reason: Option<String>,
}
