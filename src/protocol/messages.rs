//! Message documents exchanged with the broker
//!
//! Inbound: [`MessageEnvelope`] (decoded delivery) with an optional
//! [`NotifyConfig`] under the reserved `notify` key.
//! Outbound: [`StatusMessage`], [`OutputMessage`] and [`NotifyEvent`].

use crate::error::{WorkerError, WorkerResult};
use crate::transport::RawDelivery;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Reserved payload key holding the per-message notification config
pub const NOTIFY_KEY: &str = "notify";

/// Conventional payload key holding handler-specific dynamic inputs
pub const DYNAMIC_KEY: &str = "dynamic";

/// Correlation id used when the producer did not supply one
pub const MISSING_CORRELATION_ID: &str = "None";

/// Maximum slug length in characters
pub const MAX_SLUG_CHARS: usize = 80;

/// Status values published to a message's reply-to topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Completed,
    Failed,
}

/// Status document: `{status, data?}`
///
/// # Examples
/// ```
/// use reworker::protocol::StatusMessage;
///
/// let failed = StatusMessage::failed("ShellExec failed trying to parse message");
/// let json = serde_json::to_value(&failed).unwrap();
/// assert_eq!(json["status"], "failed");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl StatusMessage {
    pub fn new(status: Status) -> Self {
        Self { status, data: None }
    }

    pub fn started() -> Self {
        Self::new(Status::Started)
    }

    pub fn completed() -> Self {
        Self::new(Status::Completed)
    }

    /// Failure status carrying a diagnostic string
    pub fn failed<S: Into<String>>(data: S) -> Self {
        Self::new(Status::Failed).with_data(data)
    }

    pub fn with_data<S: Into<String>>(mut self, data: S) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Output line document: `{message}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub message: String,
}

/// Notification document: `{slug, message, phase, target}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub slug: String,
    pub message: String,
    pub phase: String,
    pub target: Value,
}

impl NotifyEvent {
    /// Build an event, truncating the slug to [`MAX_SLUG_CHARS`] characters
    pub fn new(slug: &str, message: &str, phase: &str, target: Value) -> Self {
        Self {
            slug: truncate_slug(slug),
            message: message.to_string(),
            phase: phase.to_string(),
            target,
        }
    }
}

fn truncate_slug(slug: &str) -> String {
    slug.chars().take(MAX_SLUG_CHARS).collect()
}

/// Per-message notification routing: phase -> destination suffix -> target
///
/// Phases absent from the map, or present with no destinations, produce no
/// traffic at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifyConfig(BTreeMap<String, BTreeMap<String, Value>>);

impl NotifyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the reserved `notify` key of a decoded payload.
    ///
    /// Each phase is read on its own: a malformed phase is skipped with a
    /// warning and the well-formed ones stay usable. A missing or non-object
    /// block yields an empty config.
    pub fn from_payload(payload: &Value) -> Self {
        let phases = match payload.get(NOTIFY_KEY) {
            None | Some(Value::Null) => return Self::default(),
            Some(Value::Object(phases)) => phases,
            Some(other) => {
                warn!(block = %other, "Ignoring notify block that is not an object");
                return Self::default();
            }
        };

        let mut config = Self::default();
        for (phase, destinations) in phases {
            match serde_json::from_value::<BTreeMap<String, Value>>(destinations.clone()) {
                Ok(destinations) => {
                    config.0.insert(phase.clone(), destinations);
                }
                Err(e) => warn!(%phase, error = %e, "Ignoring malformed notify phase"),
            }
        }
        config
    }

    /// Add one destination under a phase
    pub fn with_destination(mut self, phase: &str, suffix: &str, target: Value) -> Self {
        self.0
            .entry(phase.to_string())
            .or_default()
            .insert(suffix.to_string(), target);
        self
    }

    /// Destinations configured for `phase`, or `None` when there are none
    pub fn destinations(&self, phase: &str) -> Option<&BTreeMap<String, Value>> {
        self.0.get(phase).filter(|destinations| !destinations.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub correlation_id: String,
    pub reply_to: Option<String>,
    pub payload: Value,
}

impl MessageEnvelope {
    /// Decode a raw delivery. The body must be a JSON object.
    pub fn decode(delivery: &RawDelivery) -> WorkerResult<Self> {
        let payload: Value = serde_json::from_slice(&delivery.body)
            .map_err(|e| WorkerError::parse(e.to_string()))?;

        if !payload.is_object() {
            return Err(WorkerError::parse(format!(
                "expected a JSON object, got {}",
                json_kind(&payload)
            )));
        }

        Ok(Self {
            correlation_id: delivery.correlation_id_or_default(),
            reply_to: delivery.reply_to.clone(),
            payload,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(StatusMessage::started()).unwrap(),
            json!({"status": "started"})
        );
        assert_eq!(
            serde_json::to_value(StatusMessage::failed("boom")).unwrap(),
            json!({"status": "failed", "data": "boom"})
        );
    }

    #[test]
    fn test_notify_event_truncates_slug() {
        let long_slug = "s".repeat(120);
        let event = NotifyEvent::new(&long_slug, "msg", "started", json!("#ops"));
        assert_eq!(event.slug.chars().count(), MAX_SLUG_CHARS);
    }

    #[test]
    fn test_notify_config_from_payload() {
        let payload = json!({
            "notify": {
                "started": {"irc": ["#release-engine"]},
                "completed": {}
            },
            "dynamic": {}
        });

        let config = NotifyConfig::from_payload(&payload);
        let started = config.destinations("started").unwrap();
        assert_eq!(started.get("irc"), Some(&json!(["#release-engine"])));
        assert!(config.destinations("completed").is_none());
        assert!(config.destinations("failed").is_none());
        assert!(!config.is_empty());
    }

    #[test]
    fn test_notify_config_missing_or_malformed_is_empty() {
        assert!(NotifyConfig::from_payload(&json!({})).is_empty());
        assert!(NotifyConfig::from_payload(&json!({"notify": null})).is_empty());
        assert!(NotifyConfig::from_payload(&json!({"notify": ["irc"]})).is_empty());
        assert!(NotifyConfig::from_payload(&json!({"notify": {"started": "irc"}})).is_empty());
    }

    #[test]
    fn test_malformed_phase_does_not_hide_valid_ones() {
        let config = NotifyConfig::from_payload(&json!({
            "notify": {
                "completed": {"irc": ["#releng"], "email": ["ops@example.com"]},
                "failed": null,
                "started": ["irc"]
            }
        }));

        let completed = config.destinations("completed").unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed["irc"], json!(["#releng"]));
        assert!(config.destinations("failed").is_none());
        assert!(config.destinations("started").is_none());
    }

    #[test]
    fn test_decode_object_body() {
        let delivery = RawDelivery::new(7, br#"{"group": "test"}"#.to_vec())
            .with_correlation_id("abc")
            .with_reply_to("release.step");

        let envelope = MessageEnvelope::decode(&delivery).unwrap();
        assert_eq!(envelope.correlation_id, "abc");
        assert_eq!(envelope.reply_to.as_deref(), Some("release.step"));
        assert_eq!(envelope.payload["group"], "test");
    }

    #[test]
    fn test_decode_rejects_non_json_and_non_objects() {
        let garbage = RawDelivery::new(1, b"not json".to_vec());
        assert!(matches!(
            MessageEnvelope::decode(&garbage),
            Err(WorkerError::Parse(_))
        ));

        let array = RawDelivery::new(2, b"[1, 2]".to_vec());
        let error = MessageEnvelope::decode(&array).unwrap_err();
        assert!(error.to_string().contains("an array"));
    }

    #[test]
    fn test_decode_missing_correlation_id() {
        let delivery = RawDelivery::new(3, b"{}".to_vec());
        let envelope = MessageEnvelope::decode(&delivery).unwrap();
        assert_eq!(envelope.correlation_id, MISSING_CORRELATION_ID);
        assert_eq!(envelope.reply_to, None);
    }

    proptest! {
        #[test]
        fn slug_is_bounded_prefix(slug in ".*") {
            let event = NotifyEvent::new(&slug, "m", "p", Value::Null);
            prop_assert!(event.slug.chars().count() <= MAX_SLUG_CHARS);
            prop_assert!(slug.starts_with(&event.slug));
        }
    }
}
