//! `events_raw` + `events_queue` insertion.

use al_schemas::TypedEvent;
use anyhow::{Context, Result};
use sqlx::PgConnection;

/// Whether an ingest insert created a new row or found an existing one
/// (idempotent retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Insert one event into `events_raw` and enqueue it into `events_queue`
/// under insert-if-absent-by-primary-key semantics. Both inserts happen on
/// the given connection so the caller can wrap this in a
/// per-event savepoint and recover from a driver error without aborting the
/// whole ingest transaction.
pub async fn insert_event(conn: &mut PgConnection, ev: &TypedEvent) -> Result<InsertOutcome> {
    let raw_result = sqlx::query(
        r#"
        insert into events_raw
            (org_id, event_id, occurred_at, event_type, session_id, user_id, run_id, payload)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (org_id, event_id) do nothing
        "#,
    )
    .bind(&ev.org_id)
    .bind(&ev.event_id)
    .bind(ev.occurred_at)
    .bind(ev.event_type.as_str())
    .bind(&ev.session_id)
    .bind(&ev.user_id)
    .bind(&ev.run_id)
    .bind(&ev.raw_payload)
    .execute(&mut *conn)
    .await
    .context("insert into events_raw failed")?;

    let outcome = if raw_result.rows_affected() > 0 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::AlreadyExists
    };

    // Always ensure a queue entry exists, even on a duplicate raw row —
    // covers the case where a prior ingest attempt inserted events_raw but
    // crashed before enqueueing (same transaction normally prevents this,
    // but the insert-if-absent semantic is defined independently per table).
    sqlx::query(
        r#"
        insert into events_queue (org_id, event_id)
        values ($1, $2)
        on conflict (org_id, event_id) do nothing
        "#,
    )
    .bind(&ev.org_id)
    .bind(&ev.event_id)
    .execute(&mut *conn)
    .await
    .context("insert into events_queue failed")?;

    Ok(outcome)
}
