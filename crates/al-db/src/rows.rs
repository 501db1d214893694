use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SessionRow {
    pub org_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub runs_count: i64,
    pub active_agent_time_ms: i64,
    pub handoffs_count: i64,
    pub last_handoff_at: Option<DateTime<Utc>>,
    pub has_post_handoff_iteration: bool,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub cost_total: Decimal,
    pub input_tokens_total: i64,
    pub output_tokens_total: i64,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RunRow {
    pub org_id: String,
    pub run_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub cost: Decimal,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OrgDayRow {
    pub org_id: String,
    pub day: NaiveDate,
    pub sessions_count: i64,
    pub sessions_with_handoff: i64,
    pub sessions_with_post_handoff: i64,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub errors_tool: i64,
    pub errors_model: i64,
    pub errors_timeout: i64,
    pub errors_other: i64,
    pub total_duration_ms: i64,
    pub total_cost: Decimal,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub active_users_count: i64,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UserDayRow {
    pub org_id: String,
    pub user_id: String,
    pub day: NaiveDate,
    pub sessions_count: i64,
    pub sessions_with_handoff: i64,
    pub sessions_with_post_handoff: i64,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub errors_tool: i64,
    pub errors_model: i64,
    pub errors_timeout: i64,
    pub errors_other: i64,
    pub total_duration_ms: i64,
    pub total_cost: Decimal,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

/// A row claimed off `events_queue`, hydrated with its `events_raw`
/// payload in one round trip.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub org_id: String,
    pub event_id: String,
    pub inserted_at: DateTime<Utc>,
    pub attempts: i32,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub payload: serde_json::Value,
}
