//! Replay support: rebuild every read model from `events_raw` by clearing
//! the four derived tables and re-enqueuing every raw event for the worker
//! to project again from scratch.
//!
//! This is the operator-facing counterpart to spec invariant "all derived
//! state is recoverable from [the raw event log]" (spec.md §1) and
//! testable property 3 (replay equivalence, spec.md §8): the core never
//! runs this automatically, only `al-cli replay` invokes it, and it is
//! destructive to the read models (not to `events_raw`, which is never
//! touched here).

use anyhow::{Context, Result};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub events_requeued: u64,
}

/// Truncate `run_facts`, `session_stats`, `org_stats_daily`, and
/// `user_stats_daily`, then reset every `events_queue` row to unprocessed
/// (`processed_at = null`, `attempts = 0`, `last_error = null`) so the
/// worker re-derives all four read models from `events_raw` on its next
/// polls. `events_raw` itself is never modified — it is the system of
/// record this rebuilds from.
///
/// When `org_id` is `Some`, only that org's read models and queue rows are
/// reset; other orgs' projected state is left untouched. `None` replays
/// every org.
pub async fn replay_reset(pool: &PgPool, org_id: Option<&str>) -> Result<ReplayStats> {
    let mut tx = pool.begin().await.context("replay_reset: begin failed")?;

    match org_id {
        Some(org) => {
            sqlx::query("delete from run_facts where org_id = $1").bind(org).execute(&mut *tx).await?;
            sqlx::query("delete from session_stats where org_id = $1").bind(org).execute(&mut *tx).await?;
            sqlx::query("delete from org_stats_daily where org_id = $1").bind(org).execute(&mut *tx).await?;
            sqlx::query("delete from user_stats_daily where org_id = $1").bind(org).execute(&mut *tx).await?;
        }
        None => {
            sqlx::query("truncate table run_facts, session_stats, org_stats_daily, user_stats_daily")
                .execute(&mut *tx)
                .await?;
        }
    }

    // events_queue already carries one row per events_raw row under normal
    // operation (ingest inserts both under the same savepoint), but a
    // defensive re-insert covers any queue row an operator purged by hand.
    let reinserted = match org_id {
        Some(org) => {
            sqlx::query(
                r#"
                insert into events_queue (org_id, event_id)
                select org_id, event_id from events_raw where org_id = $1
                on conflict (org_id, event_id) do nothing
                "#,
            )
            .bind(org)
            .execute(&mut *tx)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                insert into events_queue (org_id, event_id)
                select org_id, event_id from events_raw
                on conflict (org_id, event_id) do nothing
                "#,
            )
            .execute(&mut *tx)
            .await?
        }
    };
    let _ = reinserted;

    let requeued = match org_id {
        Some(org) => {
            sqlx::query(
                r#"
                update events_queue
                   set processed_at = null, attempts = 0, last_error = null
                 where org_id = $1
                "#,
            )
            .bind(org)
            .execute(&mut *tx)
            .await?
        }
        None => {
            sqlx::query("update events_queue set processed_at = null, attempts = 0, last_error = null")
                .execute(&mut *tx)
                .await?
        }
    };

    tx.commit().await.context("replay_reset: commit failed")?;

    Ok(ReplayStats {
        events_requeued: requeued.rows_affected(),
    })
}
