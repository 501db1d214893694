//! The four event-type projectors. Each takes the connection a savepoint
//! was opened on and the claimed queue row, re-parses its stored payload,
//! and applies the invariants.
//!
//! A projector returning `Ok(Skipped { .. })` is not a failure: the caller
//! still marks the event processed (forward compatibility / missing-run_id
//! no-op). Only `Err` triggers a savepoint rollback.

use std::collections::BTreeMap;

use al_db::{locks, projections, rows::ClaimedEvent};
use al_schemas::{day, ErrorType, EventType, LocalHandoffPayload, Payload, RunCompletedPayload, RunStatus, POST_HANDOFF_WINDOW};
use anyhow::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorOutcome {
    Applied,
    Skipped(&'static str),
}

/// Per-session "row was absent before the group touched it" flags, computed
/// once up front by `acquire_group_locks` and consumed here one session at a
/// time. Every row this group writes to is locked before any event in the
/// group is projected, so by the time a projector runs, `session_stats`/
/// `run_facts` already exist — these functions read and mutate them, they
/// never create or lock them.
fn take_is_new(session_is_new: &mut BTreeMap<(String, String), bool>, org_id: &str, session_id: &str) -> bool {
    session_is_new
        .get_mut(&(org_id.to_string(), session_id.to_string()))
        .map(|flag| std::mem::replace(flag, false))
        .unwrap_or(false)
}

pub async fn project_event(
    conn: &mut sqlx::PgConnection,
    ev: &ClaimedEvent,
    session_is_new: &mut BTreeMap<(String, String), bool>,
) -> Result<ProjectorOutcome> {
    let Some(event_type) = EventType::parse(&ev.event_type) else {
        tracing::warn!(event_type = %ev.event_type, event_id = %ev.event_id, "unknown event_type; marking processed");
        return Ok(ProjectorOutcome::Skipped("unknown_event_type"));
    };

    let payload = Payload::parse(event_type, &ev.payload)?;

    match (event_type, payload) {
        (EventType::MessageCreated, Payload::MessageCreated) => {
            let is_new = take_is_new(session_is_new, &ev.org_id, &ev.session_id);
            message_created(conn, ev, is_new).await?;
            Ok(ProjectorOutcome::Applied)
        }
        (EventType::RunStarted, Payload::RunStarted) => {
            let Some(run_id) = ev.run_id.as_deref() else {
                tracing::warn!(event_id = %ev.event_id, "run_started missing run_id; no-op");
                return Ok(ProjectorOutcome::Skipped("missing_run_id"));
            };
            run_started(conn, ev, run_id).await?;
            Ok(ProjectorOutcome::Applied)
        }
        (EventType::RunCompleted, Payload::RunCompleted(p)) => {
            let Some(run_id) = ev.run_id.as_deref() else {
                tracing::warn!(event_id = %ev.event_id, "run_completed missing run_id; no-op");
                return Ok(ProjectorOutcome::Skipped("missing_run_id"));
            };
            run_completed(conn, ev, run_id, &p).await?;
            Ok(ProjectorOutcome::Applied)
        }
        (EventType::LocalHandoff, Payload::LocalHandoff(p)) => {
            local_handoff(conn, ev, &p).await?;
            Ok(ProjectorOutcome::Applied)
        }
        _ => unreachable!("Payload::parse returns a variant matching its EventType argument"),
    }
}

/// §4.5.1 — create or extend a session. `is_new` reflects whether the
/// `session_stats` row existed before the group's up-front lock pass
/// created it, not whether it exists now.
async fn message_created(conn: &mut sqlx::PgConnection, ev: &ClaimedEvent, is_new: bool) -> Result<()> {
    projections::apply_message_created(conn, &ev.org_id, &ev.session_id, ev.user_id.as_deref(), ev.occurred_at)
        .await?;

    if is_new {
        let d = day(ev.occurred_at);
        projections::bump_org_sessions_count(conn, &ev.org_id, d).await?;
        if let Some(user_id) = ev.user_id.as_deref() {
            projections::bump_user_sessions_count(conn, &ev.org_id, user_id, d).await?;
        }
    }
    Ok(())
}

/// §4.5.2 — seed `run_facts.started_at` and touch the session. Both rows
/// are already locked by the group's up-front pass.
async fn run_started(conn: &mut sqlx::PgConnection, ev: &ClaimedEvent, run_id: &str) -> Result<()> {
    projections::apply_run_started_run_facts(
        conn,
        &ev.org_id,
        run_id,
        &ev.session_id,
        ev.user_id.as_deref(),
        ev.occurred_at,
    )
    .await?;

    projections::touch_session_last_event(conn, &ev.org_id, &ev.session_id, ev.occurred_at).await?;
    Ok(())
}

/// §4.5.3 — terminal run facts, session counters, post-handoff window check,
/// daily aggregates.
async fn run_completed(
    conn: &mut sqlx::PgConnection,
    ev: &ClaimedEvent,
    run_id: &str,
    payload: &RunCompletedPayload,
) -> Result<()> {
    let is_success = payload.is_success();
    let status = status_str(payload.status);
    let error_bucket = payload.effective_error_type().map(error_bucket_str);
    let occurred_day = day(ev.occurred_at);

    projections::apply_run_completed_run_facts(
        conn,
        &ev.org_id,
        run_id,
        ev.occurred_at,
        status,
        payload.duration_ms as i64,
        payload.cost,
        payload.input_tokens as i64,
        payload.output_tokens as i64,
        error_bucket,
    )
    .await?;

    let session = locks::fetch_session(conn, &ev.org_id, &ev.session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session_stats row missing for {}/{}: acquire_group_locks must create it upfront", ev.org_id, ev.session_id))?;
    projections::apply_run_completed_session_counters(
        conn,
        &ev.org_id,
        &ev.session_id,
        is_success,
        payload.duration_ms as i64,
        payload.cost,
        payload.input_tokens as i64,
        payload.output_tokens as i64,
    )
    .await?;

    // Post-handoff window check, attributed to first_message_at's
    // day, falling back to this event's own day when the session has no first
    // message yet — mirrors the fallback local_handoff uses for the symmetric
    // retroactive check.
    let attribution_day = session.first_message_at.map(day).unwrap_or(occurred_day);
    if let Some(last_handoff_at) = session.last_handoff_at {
        if !session.has_post_handoff_iteration && within_post_handoff_window(last_handoff_at, ev.occurred_at) {
            projections::set_post_handoff_flag(conn, &ev.org_id, &ev.session_id).await?;
            projections::bump_org_sessions_with_post_handoff(conn, &ev.org_id, attribution_day).await?;
            if let Some(user_id) = ev.user_id.as_deref() {
                projections::bump_user_sessions_with_post_handoff(conn, &ev.org_id, user_id, attribution_day).await?;
            }
        }
    }

    projections::apply_org_daily_run_completed(
        conn,
        &ev.org_id,
        occurred_day,
        is_success,
        payload.duration_ms as i64,
        payload.cost,
        payload.input_tokens as i64,
        payload.output_tokens as i64,
        error_bucket,
    )
    .await?;

    if let Some(user_id) = ev.user_id.as_deref() {
        projections::apply_user_daily_run_completed(
            conn,
            &ev.org_id,
            user_id,
            occurred_day,
            is_success,
            payload.duration_ms as i64,
            payload.cost,
            payload.input_tokens as i64,
            payload.output_tokens as i64,
            error_bucket,
        )
        .await?;
    }

    Ok(())
}

/// §4.5.4 — handoff counters, retroactive post-handoff check, at-most-once
/// `sessions_with_handoff` guard.
async fn local_handoff(
    conn: &mut sqlx::PgConnection,
    ev: &ClaimedEvent,
    _payload: &LocalHandoffPayload,
) -> Result<()> {
    let session = locks::fetch_session(conn, &ev.org_id, &ev.session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session_stats row missing for {}/{}: acquire_group_locks must create it upfront", ev.org_id, ev.session_id))?;
    let is_first_handoff = session.handoffs_count == 0;

    projections::apply_handoff_session(conn, &ev.org_id, &ev.session_id, ev.occurred_at).await?;

    let attribution_day = session.first_message_at.map(day).unwrap_or_else(|| day(ev.occurred_at));

    // Retroactive check: does a run already sit in this handoff's window?
    if !session.has_post_handoff_iteration {
        let upper = ev.occurred_at + POST_HANDOFF_WINDOW;
        let hit =
            projections::session_has_run_completed_in_window(conn, &ev.org_id, &ev.session_id, ev.occurred_at, upper)
                .await?;
        if hit {
            projections::set_post_handoff_flag(conn, &ev.org_id, &ev.session_id).await?;
            projections::bump_org_sessions_with_post_handoff(conn, &ev.org_id, attribution_day).await?;
            if let Some(user_id) = ev.user_id.as_deref() {
                projections::bump_user_sessions_with_post_handoff(conn, &ev.org_id, user_id, attribution_day).await?;
            }
        }
    }

    if is_first_handoff {
        projections::bump_org_sessions_with_handoff(conn, &ev.org_id, attribution_day).await?;
        if let Some(user_id) = ev.user_id.as_deref() {
            projections::bump_user_sessions_with_handoff(conn, &ev.org_id, user_id, attribution_day).await?;
        }
    }

    Ok(())
}

fn within_post_handoff_window(last_handoff_at: DateTime<Utc>, occurred_at: DateTime<Utc>) -> bool {
    occurred_at > last_handoff_at && occurred_at <= last_handoff_at + POST_HANDOFF_WINDOW
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Success => "success",
        RunStatus::Fail => "fail",
        RunStatus::Timeout => "timeout",
        RunStatus::Cancelled => "cancelled",
    }
}

fn error_bucket_str(error_type: ErrorType) -> &'static str {
    match error_type {
        ErrorType::ToolError => "tool",
        ErrorType::ModelError => "model",
        ErrorType::Timeout => "timeout",
        ErrorType::Unknown => "other",
    }
}
