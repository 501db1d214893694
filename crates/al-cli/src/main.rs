//! Operator CLI for the pipeline: migrations, connectivity status, and two
//! read-only reports for manual operator action (queue poison candidates,
//! ad hoc active-user counts).

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "al-cli")]
#[command(about = "agentlens-pipeline operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Queue inspection
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },

    /// Read-model reports
    Stats {
        #[command(subcommand)]
        cmd: StatsCmd,
    },

    /// Rebuild all read models from events_raw by clearing them and
    /// re-enqueuing every raw event for the worker to re-project.
    /// Destructive to the read models (never to events_raw); requires
    /// --confirm.
    Replay {
        /// Restrict the rebuild to one org; omit to replay every org.
        #[arg(long)]
        org_id: Option<String>,
        /// Required acknowledgement that this clears read-model tables.
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Apply pending migrations.
    Migrate,
    /// Connectivity + schema presence check.
    Status,
}

#[derive(Subcommand)]
enum QueueCmd {
    /// List unprocessed events whose attempt count suggests they are stuck.
    /// There is no automatic dead-lettering; this is the manual discovery
    /// path.
    Poison {
        #[arg(long, default_value_t = 5)]
        min_attempts: i32,
    },
}

#[derive(Subcommand)]
enum StatsCmd {
    /// Compute distinct active users per org for a given day, ad hoc, from
    /// `user_stats_daily` — `active_users_count` is intentionally not
    /// maintained as a stored column.
    ActiveUsers {
        /// Day in YYYY-MM-DD form.
        #[arg(long)]
        day: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = al_db::connect_from_env().await?;
            match cmd {
                DbCmd::Migrate => {
                    al_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
                DbCmd::Status => {
                    let s = al_db::status(&pool).await?;
                    println!("db_ok={} has_events_raw_table={}", s.ok, s.has_events_raw_table);
                }
            }
        }

        Commands::Queue { cmd } => match cmd {
            QueueCmd::Poison { min_attempts } => {
                let pool = al_db::connect_from_env().await?;
                let rows = al_db::ops::queue_poison_report(&pool, min_attempts).await?;
                if rows.is_empty() {
                    println!("no queue rows with attempts >= {min_attempts}");
                } else {
                    println!("org_id\tevent_id\tattempts\tinserted_at\tlast_error");
                    for row in rows {
                        println!(
                            "{}\t{}\t{}\t{}\t{}",
                            row.org_id,
                            row.event_id,
                            row.attempts,
                            row.inserted_at.to_rfc3339(),
                            row.last_error.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        },

        Commands::Replay { org_id, confirm } => {
            if !confirm {
                anyhow::bail!("refusing to replay without --confirm (this clears read-model tables)");
            }
            let pool = al_db::connect_from_env().await?;
            let stats = al_db::replay::replay_reset(&pool, org_id.as_deref()).await?;
            println!(
                "read models cleared{}; events_requeued={}",
                org_id.as_deref().map(|o| format!(" for org_id={o}")).unwrap_or_default(),
                stats.events_requeued
            );
        }

        Commands::Stats { cmd } => match cmd {
            StatsCmd::ActiveUsers { day } => {
                let pool = al_db::connect_from_env().await?;
                let day: NaiveDate = day.parse().map_err(|e| anyhow::anyhow!("invalid --day {day:?}: {e}"))?;
                let rows = al_db::ops::active_users_report(&pool, day).await?;
                if rows.is_empty() {
                    println!("no active users recorded for {day}");
                } else {
                    println!("org_id\tday\tactive_users_count");
                    for row in rows {
                        println!("{}\t{}\t{}", row.org_id, row.day, row.active_users_count);
                    }
                }
            }
        },
    }

    Ok(())
}
