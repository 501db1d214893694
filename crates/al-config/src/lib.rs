//! Environment-driven configuration for the ingest service and the
//! projection worker.
//!
//! This pipeline's runtime knobs are a handful of scalar environment
//! variables with no layered-document or provenance-hashing need, so
//! there's no YAML layer here (see `DESIGN.md` for what that would have
//! looked like and why it was dropped) — just a typed config struct with a
//! single `from_env` constructor and documented defaults, so callers never
//! scatter raw `std::env::var` reads through the codebase.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Env var holding the Postgres connection string, shared by every binary.
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Read `DATABASE_URL` from the environment. Fails loudly and early if
/// unset — every binary in this workspace needs a database.
pub fn database_url_from_env() -> Result<String> {
    std::env::var(ENV_DATABASE_URL)
        .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))
}

/// Worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep duration between polls when the last batch was empty.
    pub poll_interval: Duration,
    /// Max rows claimed per poll.
    pub batch_size: i64,
    /// `true` selects the group-locking dispatcher; `false` selects the
    /// per-event-transaction fallback.
    pub use_batch_processor: bool,
    /// Identity recorded as `events_queue`'s claimant / dispatcher, purely
    /// for operator observability — not part of the queue protocol itself.
    pub worker_id: String,
}

impl WorkerConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
    pub const DEFAULT_BATCH_SIZE: i64 = 100;

    pub fn from_env() -> Result<Self> {
        let poll_interval_ms = env_parse_or(
            "WORKER_POLL_INTERVAL_MS",
            Self::DEFAULT_POLL_INTERVAL_MS,
        )?;
        let batch_size = env_parse_or("WORKER_BATCH_SIZE", Self::DEFAULT_BATCH_SIZE)?;
        let use_batch_processor = env_bool_or("WORKER_USE_BATCH_PROCESSOR", true)?;
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());

        Ok(Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            use_batch_processor,
            worker_id,
        })
    }
}

/// Ingest HTTP service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub bind_addr: SocketAddr,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = match std::env::var("INGEST_BIND_ADDR") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid INGEST_BIND_ADDR: {v}"))?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 8080)),
        };
        Ok(Self { bind_addr })
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow::anyhow!("invalid {key}={other:?}: expected a boolean")),
        },
        Err(_) => Ok(default),
    }
}

fn default_worker_id() -> String {
    let host = hostname_best_effort();
    format!("{host}-{}", std::process::id())
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var mutation races across tests in the same process; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn worker_config_defaults() {
        let _g = ENV_LOCK.lock().unwrap();
        for k in ["WORKER_POLL_INTERVAL_MS", "WORKER_BATCH_SIZE", "WORKER_USE_BATCH_PROCESSOR", "WORKER_ID"] {
            std::env::remove_var(k);
        }
        let cfg = WorkerConfig::from_env().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(2000));
        assert_eq!(cfg.batch_size, 100);
        assert!(cfg.use_batch_processor);
    }

    #[test]
    fn worker_config_reads_overrides() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var("WORKER_POLL_INTERVAL_MS", "500");
        std::env::set_var("WORKER_BATCH_SIZE", "25");
        std::env::set_var("WORKER_USE_BATCH_PROCESSOR", "false");
        std::env::set_var("WORKER_ID", "w-1");

        let cfg = WorkerConfig::from_env().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.batch_size, 25);
        assert!(!cfg.use_batch_processor);
        assert_eq!(cfg.worker_id, "w-1");

        for k in ["WORKER_POLL_INTERVAL_MS", "WORKER_BATCH_SIZE", "WORKER_USE_BATCH_PROCESSOR", "WORKER_ID"] {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn worker_config_rejects_invalid_bool() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var("WORKER_USE_BATCH_PROCESSOR", "maybe");
        assert!(WorkerConfig::from_env().is_err());
        std::env::remove_var("WORKER_USE_BATCH_PROCESSOR");
    }

    #[test]
    fn ingest_config_default_bind_addr() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::remove_var("INGEST_BIND_ADDR");
        let cfg = IngestConfig::from_env().unwrap();
        assert_eq!(cfg.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
    }
}
