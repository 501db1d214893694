//! Row-lock acquisition for the group dispatcher.
//!
//! The fixed global order is `org_stats_daily → user_stats_daily →
//! session_stats → run_facts`; callers lock every key touched by a group in
//! that order, sorted lexicographically within each table, before
//! processing any event. All locking here uses a blocking `FOR UPDATE`
//! select — never skip-locked — because overlapping groups must serialize,
//! not skip each other.
//!
//! All four tables use an ensure-then-lock pattern (`INSERT ... ON CONFLICT
//! DO NOTHING`, then `SELECT ... FOR UPDATE`) that guarantees the row exists
//! before it's locked, since a group's dispatcher acquires every lock it
//! will need up front rather than creating rows lazily as projectors run.
//! [`ensure_session`] additionally reports whether it created the row,
//! since `message_created`'s `sessions_count` bump needs to know whether
//! the session existed before this group touched it.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::PgConnection;

use crate::rows::{OrgDayRow, RunRow, SessionRow, UserDayRow};

pub async fn lock_org_day(conn: &mut PgConnection, org_id: &str, day: NaiveDate) -> Result<OrgDayRow> {
    sqlx::query(
        r#"
        insert into org_stats_daily (org_id, day)
        values ($1, $2)
        on conflict (org_id, day) do nothing
        "#,
    )
    .bind(org_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("lock_org_day ensure failed")?;

    sqlx::query_as::<_, OrgDayRow>(
        "select * from org_stats_daily where org_id = $1 and day = $2 for update",
    )
    .bind(org_id)
    .bind(day)
    .fetch_one(&mut *conn)
    .await
    .context("lock_org_day select failed")
}

pub async fn lock_user_day(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
) -> Result<UserDayRow> {
    sqlx::query(
        r#"
        insert into user_stats_daily (org_id, user_id, day)
        values ($1, $2, $3)
        on conflict (org_id, user_id, day) do nothing
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .execute(&mut *conn)
    .await
    .context("lock_user_day ensure failed")?;

    sqlx::query_as::<_, UserDayRow>(
        "select * from user_stats_daily where org_id = $1 and user_id = $2 and day = $3 for update",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .fetch_one(&mut *conn)
    .await
    .context("lock_user_day select failed")
}

/// Lock the `session_stats` row for `(org_id, session_id)` if it already
/// exists. Returns `None` without locking anything when the session has
/// never been observed — there is no row to lock yet, and the first write
/// this group issues for it will create (and thus implicitly lock, for the
/// remainder of this transaction) the row.
pub async fn lock_session(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
) -> Result<Option<SessionRow>> {
    sqlx::query_as::<_, SessionRow>(
        "select * from session_stats where org_id = $1 and session_id = $2 for update",
    )
    .bind(org_id)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock_session select failed")
}

/// Ensure the `session_stats` row exists, creating it with zero/NULL
/// defaults if absent, and return it along with whether this call created
/// it. Used by the first projector in a group that needs to write to a
/// not-yet-existing session (message_created, run_started).
pub async fn ensure_session(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
) -> Result<(SessionRow, bool)> {
    if let Some(row) = sqlx::query_as::<_, SessionRow>(
        r#"
        insert into session_stats (org_id, session_id)
        values ($1, $2)
        on conflict (org_id, session_id) do nothing
        returning *
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await
    .context("ensure_session insert failed")?
    {
        return Ok((row, true));
    }

    let row = sqlx::query_as::<_, SessionRow>(
        "select * from session_stats where org_id = $1 and session_id = $2 for update",
    )
    .bind(org_id)
    .bind(session_id)
    .fetch_one(&mut *conn)
    .await
    .context("ensure_session select failed")?;
    Ok((row, false))
}

pub async fn lock_run(conn: &mut PgConnection, org_id: &str, run_id: &str, session_id: &str) -> Result<RunRow> {
    sqlx::query(
        r#"
        insert into run_facts (org_id, run_id, session_id)
        values ($1, $2, $3)
        on conflict (org_id, run_id) do nothing
        "#,
    )
    .bind(org_id)
    .bind(run_id)
    .bind(session_id)
    .execute(&mut *conn)
    .await
    .context("lock_run ensure failed")?;

    sqlx::query_as::<_, RunRow>("select * from run_facts where org_id = $1 and run_id = $2 for update")
        .bind(org_id)
        .bind(run_id)
        .fetch_one(&mut *conn)
        .await
        .context("lock_run select failed")
}

/// Read the current `session_stats` row without taking a new lock — valid
/// only when the caller already holds the row lock for the duration of the
/// transaction (read-your-own-writes under the same transaction).
pub async fn fetch_session(
    conn: &mut PgConnection,
    org_id: &str,
    session_id: &str,
) -> Result<Option<SessionRow>> {
    sqlx::query_as::<_, SessionRow>("select * from session_stats where org_id = $1 and session_id = $2")
        .bind(org_id)
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await
        .context("fetch_session failed")
}
