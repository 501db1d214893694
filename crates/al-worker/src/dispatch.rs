//! Batch dispatcher: groups a claimed batch by `(org_id, user_id)`, opens
//! one transaction per group, acquires the fixed lock order, and processes
//! events one by one under per-event savepoints.

use std::collections::{BTreeMap, BTreeSet};

use al_db::rows::ClaimedEvent;
use al_db::{locks, queue};
use al_schemas::day;
use anyhow::Result;
use chrono::NaiveDate;
use sqlx::PgPool;

use crate::projectors::{self, ProjectorOutcome};

/// Per-session `is_new` flags computed once, up front, for a whole group.
/// `message_created` consumes (takes) its session's entry the first time it
/// checks it, matching the spec's "row absent" read evaluated at the start
/// of the group's transaction rather than once per individual event.
type SessionIsNew = BTreeMap<(String, String), bool>;

/// Outcome of one `claim → dispatch` cycle: how many events were applied
/// and how many failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub processed: u64,
    pub failed: u64,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// Group claimed events by partition key `(org_id, user_id)`. A `None`
/// `user_id` is its own group per org. `BTreeMap` gives a
/// deterministic group iteration order; within each group, events keep
/// claim order (stable sort by `inserted_at`, already the order `claim_batch`
/// returned them in).
fn group_by_partition(batch: Vec<ClaimedEvent>) -> BTreeMap<(String, Option<String>), Vec<ClaimedEvent>> {
    let mut groups: BTreeMap<(String, Option<String>), Vec<ClaimedEvent>> = BTreeMap::new();
    for ev in batch {
        let key = (ev.org_id.clone(), ev.user_id.clone());
        groups.entry(key).or_default().push(ev);
    }
    groups
}

/// Run the group-locking dispatcher over one claimed batch. Groups are
/// processed sequentially here; nothing about the protocol prevents
/// running them concurrently (only within-group ordering is required), but
/// a single worker replica gains little from doing so since `claim_batch`
/// already spreads work across replicas.
pub async fn dispatch_batch(pool: &PgPool, batch: Vec<ClaimedEvent>) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    for (_, events) in group_by_partition(batch) {
        let group_report = dispatch_group(pool, events).await?;
        report.merge(group_report);
    }
    Ok(report)
}

async fn dispatch_group(pool: &PgPool, events: Vec<ClaimedEvent>) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            record_group_failure(pool, &events, &e.to_string()).await;
            report.failed += events.len() as u64;
            return Ok(report);
        }
    };

    let mut session_is_new = match acquire_group_locks(&mut tx, &events).await {
        Ok(m) => m,
        Err(e) => {
            tx.rollback().await.ok();
            record_group_failure(pool, &events, &e.to_string()).await;
            report.failed += events.len() as u64;
            return Ok(report);
        }
    };

    for ev in &events {
        match process_one_event(&mut tx, ev, &mut session_is_new).await {
            Ok(()) => report.processed += 1,
            Err(_) => report.failed += 1,
        }
    }

    if let Err(e) = tx.commit().await {
        record_group_failure(pool, &events, &e.to_string()).await;
        return Ok(DispatchReport {
            processed: 0,
            failed: events.len() as u64,
        });
    }

    Ok(report)
}

/// Acquire every row lock this group will touch, across all four tables, in
/// the fixed global order `org_stats_daily → user_stats_daily →
/// session_stats → run_facts`, keys sorted lexicographically within each
/// table, before any event is processed.
///
/// `session_stats` and `run_facts` rows are created if absent (insert-if-
/// absent-then-lock) as part of this same up-front pass, not lazily inside
/// the projectors: two overlapping groups that each touch the same pair of
/// sessions (or a shared run + session) in opposite claim order would
/// otherwise lock them in opposite order and deadlock — exactly the
/// null-vs-set-`user_id` case §5 requires to work. `session_stats`'s
/// `is_new` ("row absent before this group touched it") is captured once
/// per session here and returned so `message_created` doesn't need to
/// re-derive it by re-locking later.
///
/// `org_stats_daily`/`user_stats_daily` day buckets include not only every
/// event's own `occurred_at` day but also — folded in before those two
/// tables are locked — each touched session's existing `first_message_at`
/// day, read without a lock purely to plan the lock set: a session with no
/// `first_message_at` yet (or not existing at all) falls back to its own
/// `occurred_at` day once the projector runs, which is already
/// unconditionally included below.
async fn acquire_group_locks(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    events: &[ClaimedEvent],
) -> Result<SessionIsNew> {
    let mut session_keys: BTreeSet<(String, String)> = BTreeSet::new();
    let mut run_keys: BTreeSet<(String, String)> = BTreeSet::new();
    let mut run_session: BTreeMap<(String, String), String> = BTreeMap::new();

    for ev in events {
        session_keys.insert((ev.org_id.clone(), ev.session_id.clone()));
        if let Some(run_id) = &ev.run_id {
            let key = (ev.org_id.clone(), run_id.clone());
            run_keys.insert(key.clone());
            run_session.entry(key).or_insert_with(|| ev.session_id.clone());
        }
    }

    let mut org_days: BTreeSet<(String, NaiveDate)> = BTreeSet::new();
    let mut user_days: BTreeSet<(String, String, NaiveDate)> = BTreeSet::new();
    for ev in events {
        org_days.insert((ev.org_id.clone(), day(ev.occurred_at)));
        if let Some(user_id) = &ev.user_id {
            user_days.insert((ev.org_id.clone(), user_id.clone(), day(ev.occurred_at)));
        }
    }
    for (org_id, session_id) in &session_keys {
        if let Some(existing) = locks::fetch_session(&mut **tx, org_id, session_id).await? {
            if let Some(first_at) = existing.first_message_at {
                let attribution_day = day(first_at);
                org_days.insert((org_id.clone(), attribution_day));
                let user_id = existing.user_id.clone().or_else(|| {
                    events
                        .iter()
                        .find(|e| &e.org_id == org_id && &e.session_id == session_id)
                        .and_then(|e| e.user_id.clone())
                });
                if let Some(user_id) = user_id {
                    user_days.insert((org_id.clone(), user_id, attribution_day));
                }
            }
        }
    }

    for (org_id, d) in &org_days {
        locks::lock_org_day(&mut **tx, org_id, *d).await?;
    }
    for (org_id, user_id, d) in &user_days {
        locks::lock_user_day(&mut **tx, org_id, user_id, *d).await?;
    }

    let mut session_is_new = SessionIsNew::new();
    for (org_id, session_id) in &session_keys {
        let (_, is_new) = locks::ensure_session(&mut **tx, org_id, session_id).await?;
        session_is_new.insert((org_id.clone(), session_id.clone()), is_new);
    }

    for key @ (org_id, run_id) in &run_keys {
        let session_id = run_session
            .get(key)
            .expect("a run key is only inserted alongside the event's own session_id");
        locks::lock_run(&mut **tx, org_id, run_id, session_id).await?;
    }

    Ok(session_is_new)
}

async fn process_one_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ev: &ClaimedEvent,
    session_is_new: &mut SessionIsNew,
) -> Result<()> {
    let mut savepoint = tx.begin().await?;

    match projectors::project_event(&mut savepoint, ev, session_is_new).await {
        Ok(ProjectorOutcome::Applied) => {
            queue::mark_processed(&mut *savepoint, &ev.org_id, &ev.event_id).await?;
            savepoint.commit().await?;
            Ok(())
        }
        Ok(ProjectorOutcome::Skipped(_reason)) => {
            queue::mark_processed(&mut *savepoint, &ev.org_id, &ev.event_id).await?;
            savepoint.commit().await?;
            Ok(())
        }
        Err(e) => {
            savepoint.rollback().await.ok();
            queue::mark_failed(&mut **tx, &ev.org_id, &ev.event_id, &e.to_string()).await?;
            Err(e)
        }
    }
}

/// Whole-transaction failure path: record the failure on every event in
/// the group outside the aborted transaction, leaving them claimable on
/// the next poll.
async fn record_group_failure(pool: &PgPool, events: &[ClaimedEvent], message: &str) {
    for ev in events {
        if let Err(e) = queue::mark_failed(pool, &ev.org_id, &ev.event_id, message).await {
            tracing::error!(org_id = %ev.org_id, event_id = %ev.event_id, error = %e, "failed to record group failure");
        }
    }
}

/// Ensure the `session_stats` row (and `run_facts` row, if this event
/// carries a `run_id`) exist before projecting, mirroring
/// `acquire_group_locks`'s row-creation step for a single-event "group" of
/// size one. Used only by [`run_per_event`]'s no-group-locking fallback.
async fn ensure_rows_for_event(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, ev: &ClaimedEvent) -> Result<bool> {
    let (_, is_new) = locks::ensure_session(&mut **tx, &ev.org_id, &ev.session_id).await?;
    if let Some(run_id) = &ev.run_id {
        locks::lock_run(&mut **tx, &ev.org_id, run_id, &ev.session_id).await?;
    }
    Ok(is_new)
}

/// Per-event-transaction fallback dispatcher, selected via
/// `WORKER_USE_BATCH_PROCESSOR=false`. One transaction per event, no group
/// locking. Included for compatibility/debugging; weaker ordering and lower
/// throughput than [`dispatch_batch`].
pub async fn run_per_event(pool: &PgPool, batch: Vec<ClaimedEvent>) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    for ev in batch {
        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                record_group_failure(pool, std::slice::from_ref(&ev), &e.to_string()).await;
                report.failed += 1;
                continue;
            }
        };

        let is_new = match ensure_rows_for_event(&mut tx, &ev).await {
            Ok(is_new) => is_new,
            Err(e) => {
                tx.rollback().await.ok();
                record_group_failure(pool, std::slice::from_ref(&ev), &e.to_string()).await;
                report.failed += 1;
                continue;
            }
        };
        let mut session_is_new = SessionIsNew::new();
        session_is_new.insert((ev.org_id.clone(), ev.session_id.clone()), is_new);

        match projectors::project_event(&mut tx, &ev, &mut session_is_new).await {
            Ok(_) => {
                if let Err(e) = queue::mark_processed(&mut *tx, &ev.org_id, &ev.event_id).await {
                    tx.rollback().await.ok();
                    record_group_failure(pool, std::slice::from_ref(&ev), &e.to_string()).await;
                    report.failed += 1;
                    continue;
                }
                match tx.commit().await {
                    Ok(()) => report.processed += 1,
                    Err(e) => {
                        record_group_failure(pool, std::slice::from_ref(&ev), &e.to_string()).await;
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                tx.rollback().await.ok();
                record_group_failure(pool, std::slice::from_ref(&ev), &e.to_string()).await;
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ev(org: &str, user: Option<&str>, id: &str) -> ClaimedEvent {
        ClaimedEvent {
            org_id: org.to_string(),
            event_id: id.to_string(),
            inserted_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            attempts: 1,
            occurred_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            event_type: "message_created".to_string(),
            session_id: "s1".to_string(),
            user_id: user.map(str::to_string),
            run_id: None,
            payload: json!({}),
        }
    }

    #[test]
    fn groups_by_org_and_user_with_null_user_as_its_own_group() {
        let batch = vec![
            ev("org-a", Some("u1"), "e1"),
            ev("org-a", None, "e2"),
            ev("org-a", Some("u1"), "e3"),
            ev("org-b", Some("u1"), "e4"),
        ];
        let groups = group_by_partition(batch);
        assert_eq!(groups.len(), 3);
        assert_eq!(
            groups[&("org-a".to_string(), Some("u1".to_string()))].len(),
            2
        );
        assert_eq!(groups[&("org-a".to_string(), None)].len(), 1);
        assert_eq!(
            groups[&("org-b".to_string(), Some("u1".to_string()))].len(),
            1
        );
    }

    #[test]
    fn preserves_claim_order_within_a_group() {
        let batch = vec![
            ev("org-a", Some("u1"), "e1"),
            ev("org-a", Some("u1"), "e2"),
            ev("org-a", Some("u1"), "e3"),
        ];
        let groups = group_by_partition(batch);
        let g = &groups[&("org-a".to_string(), Some("u1".to_string()))];
        assert_eq!(
            g.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "e2", "e3"]
        );
    }
}
