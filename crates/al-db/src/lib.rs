//! Postgres access layer for the event store and read models.
//!
//! A thin `connect`/`migrate` surface at the crate root, plus one module
//! per concern. Every function that participates in the group-locking
//! protocol takes an `&mut PgConnection` so callers can pass either a bare
//! `Transaction` or a nested transaction (Postgres `SAVEPOINT`, acquired
//! via `tx.begin()`) without this crate knowing which.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod locks;
pub mod ops;
pub mod projections;
pub mod queue;
pub mod raw;
pub mod replay;
pub mod rows;

pub use rows::{OrgDayRow, RunRow, SessionRow, UserDayRow};

/// Connect to Postgres using `DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = al_config::database_url_from_env()?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations against the event store schema.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connectivity + schema-presence check for `al-cli db status`.
#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_events_raw_table: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1").fetch_one(pool).await.context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'events_raw'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_events_raw_table: exists,
    })
}

/// Test helper: connect using `DATABASE_URL` and ensure migrations are
/// applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}
