use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header naming the agent an executor report comes from.
pub const HEADER_AGENT_ID: &str = "agent_id";
/// Header carrying the attempt number an executor report belongs to.
pub const HEADER_ATTEMPT: &str = "attempt";

/// An immutable, timestamped notification published on a topic.
///
/// Events are created by any component and never mutated after publish. The
/// router stamps `sequence` when the event is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: Uuid,
    /// Router-assigned publish order. Zero until published.
    #[serde(default)]
    pub sequence: u64,
    /// Dot-separated topic, `<entity>.<id>.<kind>`.
    pub topic: String,
    /// Structured payload; an output record, a reason string, or a state change.
    pub payload: serde_json::Value,
    /// Routing metadata (e.g. [`HEADER_AGENT_ID`], [`HEADER_ATTEMPT`]).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// UTC timestamp of when the event was created.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an unpublished event with no headers.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            topic: topic.into(),
            payload,
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.headers.insert(key.into(), value.to_string());
        self
    }

    /// The entity segment (`agent`, `task`, `workflow`).
    pub fn entity(&self) -> Option<&str> {
        crate::topics::split(&self.topic).map(|(entity, _, _)| entity)
    }

    /// The identifier segment of the topic.
    pub fn entity_id(&self) -> Option<&str> {
        crate::topics::split(&self.topic).map(|(_, id, _)| id)
    }

    /// The identifier segment parsed as a UUID.
    pub fn entity_uuid(&self) -> Option<Uuid> {
        self.entity_id().and_then(|id| Uuid::parse_str(id).ok())
    }

    /// The kind segment (last segment) of the topic.
    pub fn kind(&self) -> Option<&str> {
        crate::topics::split(&self.topic).map(|(_, _, kind)| kind)
    }

    /// A header value, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The payload as a string, used for failure reasons.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::topics;

    #[test]
    fn test_topic_accessors() {
        let id = Uuid::new_v4();
        let event = Event::new(topics::task(id, topics::COMPLETED), serde_json::json!({"ok": true}));
        assert_eq!(event.entity(), Some("task"));
        assert_eq!(event.entity_uuid(), Some(id));
        assert_eq!(event.kind(), Some("completed"));
        assert_eq!(event.sequence, 0);
    }

    #[test]
    fn test_payload_text() {
        let event = Event::new("task.x.failed", serde_json::json!("disk full"));
        assert_eq!(event.payload_text(), "disk full");
        let event = Event::new("task.x.failed", serde_json::Value::Null);
        assert_eq!(event.payload_text(), "");
    }

    #[test]
    fn test_headers() {
        let event = Event::new("task.x.failed", serde_json::Value::Null)
            .with_header(HEADER_ATTEMPT, 2)
            .with_header(HEADER_AGENT_ID, "a1");
        assert_eq!(event.header(HEADER_ATTEMPT), Some("2"));
        assert_eq!(event.header(HEADER_AGENT_ID), Some("a1"));
        assert_eq!(event.header("missing"), None);
    }
}
