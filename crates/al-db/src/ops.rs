//! Read-only operator reports for `al-cli`.
//!
//! Neither query here is part of the projection pipeline's write path: both
//! are ad hoc, computed-on-read conveniences for an operator, not
//! maintained incrementally by any projector.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::PgPool;

/// A queue row that has failed enough times to be worth an operator's
/// attention. There is no automatic dead-lettering: `attempts` grows
/// unbounded and this report is the manual discovery path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PoisonedEvent {
    pub org_id: String,
    pub event_id: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub inserted_at: chrono::DateTime<chrono::Utc>,
}

pub async fn queue_poison_report(pool: &PgPool, min_attempts: i32) -> Result<Vec<PoisonedEvent>> {
    sqlx::query_as::<_, PoisonedEvent>(
        r#"
        select org_id, event_id, attempts, last_error, inserted_at
        from events_queue
        where processed_at is null
          and attempts >= $1
        order by attempts desc, inserted_at asc
        "#,
    )
    .bind(min_attempts)
    .fetch_all(pool)
    .await
    .context("queue_poison_report failed")
}

/// One row of the ad hoc `active_users_count` computation: the projectors
/// never maintain this field, so it is recomputed here on demand from
/// `user_stats_daily` rather than read off a column.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveUsersRow {
    pub org_id: String,
    pub day: NaiveDate,
    pub active_users_count: i64,
}

pub async fn active_users_report(pool: &PgPool, day: NaiveDate) -> Result<Vec<ActiveUsersRow>> {
    sqlx::query_as::<_, ActiveUsersRow>(
        r#"
        select org_id, day, count(*)::bigint as active_users_count
        from user_stats_daily
        where day = $1
        group by org_id, day
        order by org_id
        "#,
    )
    .bind(day)
    .fetch_all(pool)
    .await
    .context("active_users_report failed")
}
