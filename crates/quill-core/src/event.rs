//! Events and the bus that carries them.
//!
//! An [`Event`] is an immutable fact. Its identity for deduplication is
//! `(name, id)`; events sent without an id get a fresh UUID when stamped,
//! so re-sending them may start duplicate runs.

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuillError, Result};

/// Largest accepted serialized `data` payload.
pub const MAX_EVENT_DATA_BYTES: usize = 512 * 1024;

/// An event as it travels on the wire: `{name, data, id?, ts?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `users/deletion.requested`.
    pub name: String,
    /// Event payload. Always a JSON object once validated.
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    /// Caller-supplied id; assigned by [`Event::stamped`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Emission time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Event {
    /// Create an event without id or timestamp.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
            ts: None,
        }
    }

    /// Create an event from a serializable payload.
    pub fn from_payload<T: Serialize>(name: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(name, serde_json::to_value(payload)?))
    }

    /// Set a stable id, making re-delivery idempotent.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Fill in a missing id and timestamp.
    pub fn stamped(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(Uuid::new_v4().to_string());
        }
        if self.ts.is_none() {
            self.ts = Some(Utc::now().timestamp_millis());
        }
        self
    }

    /// The event id, empty when not yet stamped.
    pub fn event_id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Check the payload is acceptable for dispatch.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(QuillError::Validation("event name is required".into()));
        }
        if name.len() != self.name.len() || name.contains(char::is_whitespace) {
            return Err(QuillError::Validation(format!(
                "event name '{}' must not contain whitespace",
                self.name
            )));
        }
        if !self.data.is_object() {
            return Err(QuillError::Validation(format!(
                "event '{}' data must be a JSON object",
                self.name
            )));
        }
        let size = serde_json::to_vec(&self.data)?.len();
        if size > MAX_EVENT_DATA_BYTES {
            return Err(QuillError::Validation(format!(
                "event '{}' data is {} bytes, limit is {}",
                self.name, size, MAX_EVENT_DATA_BYTES
            )));
        }
        Ok(())
    }

    /// Deserialize the payload into a typed value.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| QuillError::Validation(format!("event '{}': {}", self.name, e)))
    }
}

/// Trigger predicate over event names.
///
/// An exact name, or a prefix followed by `*` (`users/*`). A bare `*` matches
/// every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPattern(String);

impl EventPattern {
    /// Create a pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the event name satisfies this pattern.
    pub fn matches(&self, event_name: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => event_name.starts_with(prefix),
            None => self.0 == event_name,
        }
    }
}

impl From<&str> for EventPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement that events were handed to the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Ids of the accepted events, in send order.
    pub ids: Vec<String>,
}

/// Producer side of the event bus.
///
/// `send` only enqueues; it never waits for triggered runs. Implementations
/// must be safe to share between concurrent producers.
pub trait EventBus: Send + Sync {
    /// Deliver events to the broker.
    fn send(&self, events: Vec<Event>) -> BoxFuture<'_, Result<SendReceipt>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        let exact = EventPattern::new("users/deletion.requested");
        assert!(exact.matches("users/deletion.requested"));
        assert!(!exact.matches("users/deletion.requested.v2"));

        let prefix = EventPattern::new("sessions/*");
        assert!(prefix.matches("sessions/scheduled"));
        assert!(prefix.matches("sessions/cancelled"));
        assert!(!prefix.matches("users/import.requested"));

        assert!(EventPattern::new("*").matches("anything"));
    }

    #[test]
    fn test_stamped_assigns_identity_once() {
        let event = Event::new("a/b", json!({})).stamped();
        let id = event.id.clone().unwrap();
        assert!(!id.is_empty());
        assert!(event.ts.is_some());

        let again = event.clone().stamped();
        assert_eq!(again.id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_stamped_keeps_caller_id() {
        let event = Event::new("a/b", json!({})).with_id("evt-1").stamped();
        assert_eq!(event.event_id(), "evt-1");
    }

    #[test]
    fn test_validate() {
        assert!(Event::new("a/b", json!({"x": 1})).validate().is_ok());
        assert!(Event::new("", json!({})).validate().is_err());
        assert!(Event::new("a b", json!({})).validate().is_err());
        assert!(Event::new("a/b", json!([1, 2])).validate().is_err());
    }

    #[test]
    fn test_wire_format() {
        let event: Event =
            serde_json::from_value(json!({"name": "a/b", "data": {"k": 1}, "ts": 10})).unwrap();
        assert_eq!(event.ts, Some(10));
        assert!(event.id.is_none());

        let missing_data: Event = serde_json::from_value(json!({"name": "a/b"})).unwrap();
        assert!(missing_data.data.is_object());

        let wire = serde_json::to_value(Event::new("a/b", json!({})).with_id("1")).unwrap();
        assert_eq!(wire, json!({"name": "a/b", "data": {}, "id": "1"}));
    }

    #[test]
    fn test_data_as() {
        #[derive(Deserialize)]
        struct Payload {
            user_id: String,
        }

        let event = Event::new("a/b", json!({"user_id": "u1"}));
        let payload: Payload = event.data_as().unwrap();
        assert_eq!(payload.user_id, "u1");

        let bad = Event::new("a/b", json!({}));
        assert!(matches!(
            bad.data_as::<Payload>(),
            Err(QuillError::Validation(_))
        ));
    }
}
