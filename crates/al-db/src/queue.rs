//! Queue claimer and queue status updates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::rows::ClaimedEvent;

const LAST_ERROR_MAX_LEN: usize = 2000;

/// Atomically claim up to `batch_size` unprocessed queue rows (skip-locked,
/// oldest first), incrementing `attempts`, and hydrate each with its
/// `events_raw` row in the same round trip.
///
/// A queue row whose `(org_id, event_id)` has no matching `events_raw` row
/// is a permanent data-integrity error: it is recorded via `last_error`
/// and excluded from the returned batch, but left unprocessed
/// (not marked done) so an operator can investigate rather than silently
/// losing data.
pub async fn claim_batch(pool: &PgPool, batch_size: i64) -> Result<Vec<ClaimedEvent>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select org_id, event_id
            from events_queue
            where processed_at is null
            order by inserted_at asc
            limit $1
            for update skip locked
        ),
        bumped as (
            update events_queue q
               set attempts = q.attempts + 1
              from to_claim c
             where q.org_id = c.org_id
               and q.event_id = c.event_id
            returning q.org_id, q.event_id, q.inserted_at, q.attempts
        )
        select
            b.org_id, b.event_id, b.inserted_at, b.attempts,
            r.occurred_at, r.event_type, r.session_id, r.user_id, r.run_id, r.payload
        from bumped b
        left join events_raw r on r.org_id = b.org_id and r.event_id = b.event_id
        order by b.inserted_at asc
        "#,
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await
    .context("claim_batch failed")?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let org_id: String = row.try_get("org_id")?;
        let event_id: String = row.try_get("event_id")?;
        let occurred_at: Option<DateTime<Utc>> = row.try_get("occurred_at")?;

        let Some(occurred_at) = occurred_at else {
            tracing::error!(
                org_id = %org_id,
                event_id = %event_id,
                "claimed queue row has no matching events_raw row"
            );
            mark_failed(
                pool,
                &org_id,
                &event_id,
                "events_raw row not found for claimed queue entry",
            )
            .await?;
            continue;
        };

        claimed.push(ClaimedEvent {
            org_id,
            event_id,
            inserted_at: row.try_get("inserted_at")?,
            attempts: row.try_get("attempts")?,
            occurred_at,
            event_type: row.try_get("event_type")?,
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            run_id: row.try_get("run_id")?,
            payload: row.try_get("payload")?,
        });
    }

    Ok(claimed)
}

/// Mark an event successfully projected: `processed_at = now()`,
/// `last_error` cleared. Runs on whatever executor the caller passes — the
/// group's own transaction for the batch dispatcher, or the pool directly
/// for the per-event fallback dispatcher.
pub async fn mark_processed<'e, E>(executor: E, org_id: &str, event_id: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        update events_queue
           set processed_at = now(),
               last_error   = null
         where org_id = $1
           and event_id = $2
        "#,
    )
    .bind(org_id)
    .bind(event_id)
    .execute(executor)
    .await
    .context("mark_processed failed")?;
    Ok(())
}

/// Record a failure without marking the event processed, so it remains
/// claimable on the next poll.
pub async fn mark_failed<'e, E>(executor: E, org_id: &str, event_id: &str, message: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let truncated = truncate_error(message);
    sqlx::query(
        r#"
        update events_queue
           set last_error = $3
         where org_id = $1
           and event_id = $2
        "#,
    )
    .bind(org_id)
    .bind(event_id)
    .bind(truncated)
    .execute(executor)
    .await
    .context("mark_failed failed")?;
    Ok(())
}

fn truncate_error(message: &str) -> String {
    if message.len() <= LAST_ERROR_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(LAST_ERROR_MAX_LEN).collect()
    }
}

/// `count(*) from events_queue where processed_at is null` — the
/// post-batch `remaining` gauge the worker loop logs.
pub async fn count_unprocessed(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from events_queue where processed_at is null")
            .fetch_one(pool)
            .await
            .context("count_unprocessed failed")?;
    Ok(n)
}
