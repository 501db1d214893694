//! Read-model upserts. Every function here assumes its caller
//! already holds the relevant row lock (via `locks::lock_*` /
//! `locks::ensure_session`) for the duration of the enclosing transaction —
//! these are plain `UPDATE`s, not `INSERT ... ON CONFLICT`, so calling one
//! against a row that doesn't exist yet is a caller bug, not a race.
//!
//! `LEAST`/`GREATEST`/`COALESCE` are pushed into the SQL so each call is one
//! round trip and the computation happens under the lock already held,
//! rather than read-modify-write from the Rust side.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;

/// `message_created`: extend a session's identity and touch its day
/// counters. Caller has already ensured the `session_stats` row exists via
/// [`crate::locks::ensure_session`].
pub async fn apply_message_created(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
    user_id: Option<&str>,
    occurred_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update session_stats
           set user_id          = coalesce(user_id, $3),
               first_message_at = least(coalesce(first_message_at, $4), $4),
               last_event_at    = greatest(coalesce(last_event_at, $4), $4)
         where org_id = $1
           and session_id = $2
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .bind(user_id)
    .bind(occurred_at)
    .execute(&mut *conn)
    .await
    .context("apply_message_created failed")?;
    Ok(())
}

pub async fn bump_org_sessions_count(conn: &mut PgConnection, org_id: &str, day: NaiveDate) -> Result<()> {
    sqlx::query("update org_stats_daily set sessions_count = sessions_count + 1 where org_id = $1 and day = $2")
        .bind(org_id)
        .bind(day)
        .execute(&mut *conn)
        .await
        .context("bump_org_sessions_count failed")?;
    Ok(())
}

pub async fn bump_user_sessions_count(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "update user_stats_daily set sessions_count = sessions_count + 1 where org_id = $1 and user_id = $2 and day = $3",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("bump_user_sessions_count failed")?;
    Ok(())
}

/// `run_started`: seed `run_facts.started_at`/identity fields and touch the
/// owning session's `last_event_at`.
pub async fn apply_run_started_run_facts(
    conn: &mut PgConnection,
    org_id: &str,
    run_id: &str,
    session_id: &str,
    user_id: Option<&str>,
    occurred_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update run_facts
           set started_at = least(coalesce(started_at, $4), $4),
               session_id = coalesce(session_id, $3),
               user_id    = coalesce(user_id, $5)
         where org_id = $1
           and run_id = $2
        "#,
    )
    .bind(org_id)
    .bind(run_id)
    .bind(session_id)
    .bind(occurred_at)
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .context("apply_run_started_run_facts failed")?;
    Ok(())
}

pub async fn touch_session_last_event(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
    occurred_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update session_stats
           set last_event_at = greatest(coalesce(last_event_at, $3), $3)
         where org_id = $1
           and session_id = $2
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .bind(occurred_at)
    .execute(&mut *conn)
    .await
    .context("touch_session_last_event failed")?;
    Ok(())
}

/// `run_completed`: overwrite `run_facts`'s terminal fields. Last-writer-wins
/// within the transaction — no `COALESCE` on the payload fields themselves,
/// only on `completed_at` which uses `GREATEST`.
#[allow(clippy::too_many_arguments)]
pub async fn apply_run_completed_run_facts(
    conn: &mut PgConnection,
    org_id: &str,
    run_id: &str,
    occurred_at: DateTime<Utc>,
    status: &str,
    duration_ms: i64,
    cost: Decimal,
    input_tokens: i64,
    output_tokens: i64,
    error_type: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update run_facts
           set completed_at  = greatest(coalesce(completed_at, $3), $3),
               status        = $4,
               duration_ms   = $5,
               cost          = $6,
               input_tokens  = $7,
               output_tokens = $8,
               error_type    = $9
         where org_id = $1
           and run_id = $2
        "#,
    )
    .bind(org_id)
    .bind(run_id)
    .bind(occurred_at)
    .bind(status)
    .bind(duration_ms)
    .bind(cost)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(error_type)
    .execute(&mut *conn)
    .await
    .context("apply_run_completed_run_facts failed")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn apply_run_completed_session_counters(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
    is_success: bool,
    duration_ms: i64,
    cost: Decimal,
    input_tokens: i64,
    output_tokens: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        update session_stats
           set runs_count           = runs_count + 1,
               active_agent_time_ms = active_agent_time_ms + $3,
               success_runs         = success_runs + case when $4 then 1 else 0 end,
               failed_runs          = failed_runs + case when $4 then 0 else 1 end,
               cost_total           = cost_total + $5,
               input_tokens_total   = input_tokens_total + $6,
               output_tokens_total  = output_tokens_total + $7
         where org_id = $1
           and session_id = $2
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .bind(duration_ms)
    .bind(is_success)
    .bind(cost)
    .bind(input_tokens)
    .bind(output_tokens)
    .execute(&mut *conn)
    .await
    .context("apply_run_completed_session_counters failed")?;
    Ok(())
}

/// Set `has_post_handoff_iteration = true`. Monotonic: callers only
/// invoke this after confirming the flag is currently false, but the
/// statement itself is a no-op if called again (flag never clears).
pub async fn set_post_handoff_flag(conn: &mut PgConnection, org_id: &str, session_id: &str) -> Result<()> {
    sqlx::query("update session_stats set has_post_handoff_iteration = true where org_id = $1 and session_id = $2")
        .bind(org_id)
        .bind(session_id)
        .execute(&mut *conn)
        .await
        .context("set_post_handoff_flag failed")?;
    Ok(())
}

pub async fn bump_org_sessions_with_post_handoff(conn: &mut PgConnection, org_id: &str, day: NaiveDate) -> Result<()> {
    sqlx::query(
        "update org_stats_daily set sessions_with_post_handoff = sessions_with_post_handoff + 1 where org_id = $1 and day = $2",
    )
    .bind(org_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("bump_org_sessions_with_post_handoff failed")?;
    Ok(())
}

pub async fn bump_user_sessions_with_post_handoff(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "update user_stats_daily set sessions_with_post_handoff = sessions_with_post_handoff + 1 where org_id = $1 and user_id = $2 and day = $3",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("bump_user_sessions_with_post_handoff failed")?;
    Ok(())
}

/// `error_bucket` is one of `"tool" | "model" | "timeout" | "other"`, or
/// `None` on a successful run (no bucket incremented).
#[allow(clippy::too_many_arguments)]
pub async fn apply_org_daily_run_completed(
    conn: &mut PgConnection,
    org_id: &str,
    day: NaiveDate,
    is_success: bool,
    duration_ms: i64,
    cost: Decimal,
    input_tokens: i64,
    output_tokens: i64,
    error_bucket: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update org_stats_daily
           set runs_count         = runs_count + 1,
               success_runs       = success_runs + case when $3 then 1 else 0 end,
               failed_runs        = failed_runs + case when $3 then 0 else 1 end,
               errors_tool        = errors_tool + case when $8 = 'tool' then 1 else 0 end,
               errors_model       = errors_model + case when $8 = 'model' then 1 else 0 end,
               errors_timeout     = errors_timeout + case when $8 = 'timeout' then 1 else 0 end,
               errors_other       = errors_other + case when $8 = 'other' then 1 else 0 end,
               total_duration_ms  = total_duration_ms + $4,
               total_cost         = total_cost + $5,
               total_input_tokens  = total_input_tokens + $6,
               total_output_tokens = total_output_tokens + $7
         where org_id = $1
           and day = $2
        "#,
    )
    .bind(org_id)
    .bind(day)
    .bind(is_success)
    .bind(duration_ms)
    .bind(cost)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(error_bucket)
    .execute(&mut *conn)
    .await
    .context("apply_org_daily_run_completed failed")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn apply_user_daily_run_completed(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
    is_success: bool,
    duration_ms: i64,
    cost: Decimal,
    input_tokens: i64,
    output_tokens: i64,
    error_bucket: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update user_stats_daily
           set runs_count          = runs_count + 1,
               success_runs        = success_runs + case when $4 then 1 else 0 end,
               failed_runs         = failed_runs + case when $4 then 0 else 1 end,
               errors_tool         = errors_tool + case when $9 = 'tool' then 1 else 0 end,
               errors_model        = errors_model + case when $9 = 'model' then 1 else 0 end,
               errors_timeout      = errors_timeout + case when $9 = 'timeout' then 1 else 0 end,
               errors_other        = errors_other + case when $9 = 'other' then 1 else 0 end,
               total_duration_ms   = total_duration_ms + $5,
               total_cost          = total_cost + $6,
               total_input_tokens  = total_input_tokens + $7,
               total_output_tokens = total_output_tokens + $8
         where org_id = $1
           and user_id = $2
           and day = $3
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .bind(is_success)
    .bind(duration_ms)
    .bind(cost)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(error_bucket)
    .execute(&mut *conn)
    .await
    .context("apply_user_daily_run_completed failed")?;
    Ok(())
}

/// `local_handoff`: bump handoff counters and touch timestamps.
pub async fn apply_handoff_session(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
    occurred_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update session_stats
           set handoffs_count  = handoffs_count + 1,
               last_handoff_at = greatest(coalesce(last_handoff_at, $3), $3),
               last_event_at   = greatest(coalesce(last_event_at, $3), $3)
         where org_id = $1
           and session_id = $2
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .bind(occurred_at)
    .execute(&mut *conn)
    .await
    .context("apply_handoff_session failed")?;
    Ok(())
}

pub async fn bump_org_sessions_with_handoff(conn: &mut PgConnection, org_id: &str, day: NaiveDate) -> Result<()> {
    sqlx::query(
        "update org_stats_daily set sessions_with_handoff = sessions_with_handoff + 1 where org_id = $1 and day = $2",
    )
    .bind(org_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("bump_org_sessions_with_handoff failed")?;
    Ok(())
}

pub async fn bump_user_sessions_with_handoff(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "update user_stats_daily set sessions_with_handoff = sessions_with_handoff + 1 where org_id = $1 and user_id = $2 and day = $3",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("bump_user_sessions_with_handoff failed")?;
    Ok(())
}

/// Any `run_facts` row in this session whose `completed_at` falls in
/// `(lower, upper]` — the retroactive post-handoff check a late-arriving
/// `local_handoff` performs.
pub async fn session_has_run_completed_in_window(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
    lower_exclusive: DateTime<Utc>,
    upper_inclusive: DateTime<Utc>,
) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from run_facts
             where org_id = $1
               and session_id = $2
               and completed_at > $3
               and completed_at <= $4
        )
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .bind(lower_exclusive)
    .bind(upper_inclusive)
    .fetch_one(&mut *conn)
    .await
    .context("session_has_run_completed_in_window failed")?;
    Ok(exists)
}
