//! Request and response shapes for the ingest HTTP endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /events` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<EventBody>,
}

/// Wire shape of one event, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBody {
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

/// Per-event failure detail, used in both the 400 (validation) and 500
/// (transaction) response shapes.
#[derive(Debug, Clone, Serialize)]
pub struct EventError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub message: String,
}

/// Common response body for all three ingest outcomes (200/400/500).
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub event_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<EventError>>,
}

impl IngestResponse {
    pub fn rejected(errors: Vec<EventError>) -> Self {
        Self {
            accepted: 0,
            event_ids: Vec::new(),
            errors: Some(errors),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyResponse {
    pub ok: bool,
}
