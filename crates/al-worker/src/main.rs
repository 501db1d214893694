//! al-worker entry point: claim → dispatch → log, on a timer, until shut down.

use al_config::WorkerConfig;
use al_db::queue;
use anyhow::Context;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!(
        worker_id = %config.worker_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        use_batch_processor = config.use_batch_processor,
        "al-worker starting"
    );

    let pool = al_db::connect_from_env().await?;
    al_db::migrate(&pool).await?;

    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, exiting after in-flight batch");
                break;
            }
            batch = queue::claim_batch(&pool, config.batch_size) => {
                let batch = batch.context("claim_batch failed")?;
                if batch.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = &mut shutdown => {
                            info!("shutdown signal received while idle");
                            break;
                        }
                    }
                    continue;
                }

                let claimed = batch.len();
                let report = if config.use_batch_processor {
                    al_worker::dispatch_batch(&pool, batch).await?
                } else {
                    al_worker::run_per_event(&pool, batch).await?
                };

                if report.failed > 0 {
                    warn!(claimed, processed = report.processed, failed = report.failed, "batch completed with failures");
                } else {
                    info!(claimed, processed = report.processed, "batch completed");
                }

                match queue::count_unprocessed(&pool).await {
                    Ok(remaining) => info!(remaining, "queue depth after batch"),
                    Err(e) => warn!(error = %e, "failed to read queue depth"),
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Resolves once SIGINT or (on Unix) SIGTERM arrives. The worker loop awaits
/// this alongside its claim future so a shutdown signal mid-sleep or
/// mid-claim breaks the loop instead of waiting out the rest of the poll
/// interval.
fn shutdown_signal() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    })
}
