use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::payload::{self, Payload};

/// The four event types this projection pipeline understands. Any other
/// string is rejected at ingest but can still appear on an already-queued
/// row produced by a different deployment generation; the worker treats
/// that as "unknown event type", not a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageCreated,
    RunStarted,
    RunCompleted,
    LocalHandoff,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::MessageCreated => "message_created",
            EventType::RunStarted => "run_started",
            EventType::RunCompleted => "run_completed",
            EventType::LocalHandoff => "local_handoff",
        }
    }

    /// Returns `None` for anything other than the four known types, rather
    /// than erroring, so callers (ingest validation vs. worker dispatch) can
    /// decide what "unknown" means in their own context.
    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "message_created" => Some(EventType::MessageCreated),
            "run_started" => Some(EventType::RunStarted),
            "run_completed" => Some(EventType::RunCompleted),
            "local_handoff" => Some(EventType::LocalHandoff),
            _ => None,
        }
    }

    pub fn requires_run_id(self) -> bool {
        matches!(self, EventType::RunStarted | EventType::RunCompleted)
    }
}

/// Wire shape of one event in an ingest batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: String,
    pub org_id: String,
    pub occurred_at: String,
    pub event_type: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// A `RawEvent` that has passed ingest validation: identifiers are
/// non-empty, `occurred_at` parses as RFC3339, `event_type` is one of the
/// four known types, `run_id` is present where required, and `payload`
/// matches the shape for `event_type`.
#[derive(Debug, Clone)]
pub struct TypedEvent {
    pub event_id: String,
    pub org_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub session_id: String,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub payload: Payload,
    /// The original JSON payload as received, preserved verbatim for
    /// storage in `events_raw.payload` — ingest never derives the stored
    /// column from the typed value; it never parses payloads beyond
    /// validation.
    pub raw_payload: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event_id must be non-empty")]
    EmptyEventId,
    #[error("org_id must be non-empty")]
    EmptyOrgId,
    #[error("session_id must be non-empty")]
    EmptySessionId,
    #[error("user_id must be non-empty when present")]
    EmptyUserId,
    #[error("occurred_at is not valid RFC3339: {0}")]
    InvalidOccurredAt(String),
    #[error("unknown event_type: {0}")]
    UnknownEventType(String),
    #[error("run_id is required for event_type {0}")]
    MissingRunId(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl RawEvent {
    /// Validate and convert into a [`TypedEvent`]. All-or-nothing: the first
    /// failing rule is reported, matching ingest's per-event error
    /// reporting.
    pub fn into_typed(self) -> Result<TypedEvent, ValidationError> {
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::EmptyEventId);
        }
        if self.org_id.trim().is_empty() {
            return Err(ValidationError::EmptyOrgId);
        }
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::EmptySessionId);
        }
        if matches!(&self.user_id, Some(u) if u.trim().is_empty()) {
            return Err(ValidationError::EmptyUserId);
        }

        let occurred_at: DateTime<Utc> = self
            .occurred_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| ValidationError::InvalidOccurredAt(e.to_string()))?;

        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| ValidationError::UnknownEventType(self.event_type.clone()))?;

        if event_type.requires_run_id() {
            let missing = match &self.run_id {
                None => true,
                Some(r) => r.trim().is_empty(),
            };
            if missing {
                return Err(ValidationError::MissingRunId(event_type.as_str()));
            }
        }

        let payload = payload::parse_for(event_type, &self.payload)?;
        let raw_payload = self.payload.clone();

        Ok(TypedEvent {
            event_id: self.event_id,
            org_id: self.org_id,
            occurred_at,
            event_type,
            session_id: self.session_id,
            user_id: self.user_id,
            run_id: self.run_id,
            payload,
            raw_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> RawEvent {
        RawEvent {
            event_id: "e1".into(),
            org_id: "org-1".into(),
            occurred_at: "2024-01-15T10:00:00Z".into(),
            event_type: "message_created".into(),
            session_id: "s1".into(),
            user_id: Some("u1".into()),
            run_id: None,
            payload: json!({}),
        }
    }

    #[test]
    fn valid_message_created_parses() {
        assert!(base().into_typed().is_ok());
    }

    #[test]
    fn empty_org_id_rejected() {
        let mut e = base();
        e.org_id = "".into();
        assert_eq!(e.into_typed().unwrap_err(), ValidationError::EmptyOrgId);
    }

    #[test]
    fn bad_timestamp_rejected() {
        let mut e = base();
        e.occurred_at = "not-a-time".into();
        assert!(matches!(
            e.into_typed().unwrap_err(),
            ValidationError::InvalidOccurredAt(_)
        ));
    }

    #[test]
    fn unknown_event_type_rejected_at_ingest() {
        let mut e = base();
        e.event_type = "something_new".into();
        assert!(matches!(
            e.into_typed().unwrap_err(),
            ValidationError::UnknownEventType(_)
        ));
    }

    #[test]
    fn run_started_requires_run_id() {
        let mut e = base();
        e.event_type = "run_started".into();
        e.run_id = None;
        assert_eq!(
            e.into_typed().unwrap_err(),
            ValidationError::MissingRunId("run_started")
        );

        e.run_id = Some("r1".into());
        assert!(e.into_typed().is_ok());
    }

    #[test]
    fn run_completed_requires_run_id_and_payload() {
        let mut e = base();
        e.event_type = "run_completed".into();
        e.run_id = Some("r1".into());
        e.payload = json!({
            "status": "success",
            "duration_ms": 1000,
            "cost": "0.02",
            "input_tokens": 100,
            "output_tokens": 50,
        });
        assert!(e.into_typed().is_ok());
    }
}
