use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ValidationError;

/// Per-event-type payload, strongly typed after ingest validation: each
/// dynamic JSON payload becomes a tagged variant keyed on `event_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MessageCreated,
    RunStarted,
    RunCompleted(RunCompletedPayload),
    LocalHandoff(LocalHandoffPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub status: RunStatus,
    pub duration_ms: u64,
    pub cost: Decimal,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
}

impl RunCompletedPayload {
    /// `error_type` absence on a non-success run is treated as `unknown`.
    pub fn effective_error_type(&self) -> Option<ErrorType> {
        if self.status == RunStatus::Success {
            return None;
        }
        Some(self.error_type.unwrap_or(ErrorType::Unknown))
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Fail,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ToolError,
    ModelError,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalHandoffPayload {
    pub method: HandoffMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffMethod {
    Teleport,
    Download,
    CopyPatch,
    Other,
}

impl Payload {
    /// Re-parse a stored `events_raw.payload` back into a typed [`Payload`]
    /// for a worker that only has the opaque JSON column and `event_type`
    /// string to work with (the worker never holds the ingest-time
    /// `TypedEvent`). Delegates to the same validation ingest already ran.
    pub fn parse(event_type: crate::event::EventType, raw: &Value) -> Result<Payload, ValidationError> {
        parse_for(event_type, raw)
    }
}

/// Parse `raw` into the payload shape required by `event_type`. `message_created`
/// and `run_started` carry no required fields; any extra keys are ignored so
/// producers can attach forward-compatible metadata.
pub(crate) fn parse_for(
    event_type: crate::event::EventType,
    raw: &Value,
) -> Result<Payload, ValidationError> {
    use crate::event::EventType::*;

    match event_type {
        MessageCreated => Ok(Payload::MessageCreated),
        RunStarted => Ok(Payload::RunStarted),
        RunCompleted => serde_json::from_value::<RunCompletedPayload>(raw.clone())
            .map(Payload::RunCompleted)
            .map_err(|e| ValidationError::InvalidPayload(format!("run_completed: {e}"))),
        LocalHandoff => serde_json::from_value::<LocalHandoffPayload>(raw.clone())
            .map(Payload::LocalHandoff)
            .map_err(|e| ValidationError::InvalidPayload(format!("local_handoff: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn run_completed_requires_known_status() {
        let raw = json!({
            "status": "bogus",
            "duration_ms": 1,
            "cost": "0.01",
            "input_tokens": 1,
            "output_tokens": 1,
        });
        assert!(parse_for(EventType::RunCompleted, &raw).is_err());
    }

    #[test]
    fn run_completed_defaults_missing_error_type_to_unknown() {
        let raw = json!({
            "status": "fail",
            "duration_ms": 1000,
            "cost": "0.10",
            "input_tokens": 10,
            "output_tokens": 5,
        });
        let Payload::RunCompleted(p) = parse_for(EventType::RunCompleted, &raw).unwrap() else {
            panic!("expected RunCompleted");
        };
        assert_eq!(p.effective_error_type(), Some(ErrorType::Unknown));
    }

    #[test]
    fn run_completed_success_has_no_error_type() {
        let raw = json!({
            "status": "success",
            "duration_ms": 1000,
            "cost": "0.10",
            "input_tokens": 10,
            "output_tokens": 5,
            "error_type": "tool_error",
        });
        let Payload::RunCompleted(p) = parse_for(EventType::RunCompleted, &raw).unwrap() else {
            panic!("expected RunCompleted");
        };
        assert_eq!(p.effective_error_type(), None);
    }

    #[test]
    fn local_handoff_requires_method() {
        let raw = json!({});
        assert!(parse_for(EventType::LocalHandoff, &raw).is_err());

        let raw = json!({"method": "teleport"});
        assert!(parse_for(EventType::LocalHandoff, &raw).is_ok());
    }

    #[test]
    fn message_created_ignores_unknown_fields() {
        let raw = json!({"anything": "goes"});
        assert_eq!(
            parse_for(EventType::MessageCreated, &raw).unwrap(),
            Payload::MessageCreated
        );
    }
}
