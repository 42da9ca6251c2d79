//! Operator CLI for the persistent message buffer.
//!
//! Inspects and manages the store file used by a running (or stopped)
//! bridge. Exit codes: 0 success, 1 usage error, 2 store unavailable,
//! 3 integrity check failed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use telebridge::message::{format_millis, now_millis};
use telebridge::{BridgeError, Store};

#[derive(Parser, Debug)]
#[command(name = "buffer-monitor")]
#[command(about = "Inspect and manage the bridge's persistent message buffer")]
struct Args {
    /// Path to the store file.
    #[arg(long, default_value = "buffer.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the last metric snapshot and live counts per status.
    Stats,
    /// Refresh stats on an interval until interrupted.
    Monitor {
        /// Refresh interval in seconds.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// List the oldest pending messages in claim order.
    Pending {
        /// Maximum rows to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List the newest entries of the failed-message archive.
    Failed {
        /// Maximum rows to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Remove completed messages older than the given age.
    Cleanup {
        /// Age threshold in days.
        #[arg(long)]
        days: u32,
    },
    /// Return all processing messages to pending. Retry counts and
    /// last_error are left unchanged.
    Reset,
    /// Write a metric history dump as JSON.
    Export {
        /// Output file path.
        #[arg(long, default_value = "buffer_stats.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::WARN.into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return ExitCode::from(1);
        }
        Err(help) => {
            // --help / --version
            let _ = help.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            match err {
                BridgeError::Integrity(_) => ExitCode::from(3),
                _ => ExitCode::from(2),
            }
        }
    }
}

async fn run(args: Args) -> Result<(), BridgeError> {
    if !args.db.exists() {
        return Err(BridgeError::StoreUnavailable(sqlx::Error::Io(
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store file not found: {}", args.db.display()),
            ),
        )));
    }

    let store = Store::open(&args.db).await?;

    match args.command {
        Command::Stats => {
            store.integrity_check().await?;
            print_stats(&store).await?;
        }
        Command::Monitor { interval } => {
            let interval = std::time::Duration::from_secs(interval.max(1));
            loop {
                print!("\x1b[2J\x1b[H");
                println!("buffer monitor - {}", format_millis(now_millis()));
                print_stats(&store).await?;
                println!("\nrefreshing every {}s, ctrl-c to stop", interval.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Pending { limit } => {
            let rows = store.pending_messages(limit).await?;
            if rows.is_empty() {
                println!("no pending messages");
            } else {
                println!(
                    "{:>6}  {:<8} {:<8} {:<32} {:<25} {:>7} {:>5}",
                    "id", "source", "dest", "topic/node", "created", "retries", "prio"
                );
                for row in rows {
                    println!(
                        "{:>6}  {:<8} {:<8} {:<32} {:<25} {:>7} {:>5}",
                        row.id,
                        format!("{:?}", row.source).to_lowercase(),
                        format!("{:?}", row.destination).to_lowercase(),
                        truncate(&row.topic_or_node, 32),
                        format_millis(row.created_at),
                        row.retry_count,
                        row.priority as i32,
                    );
                }
            }
        }
        Command::Failed { limit } => {
            let rows = store.failed_archive(limit).await?;
            if rows.is_empty() {
                println!("no failed messages");
            }
            for row in rows {
                println!("id {} (original {})", row.id, row.original_id);
                println!(
                    "  route: {} -> {}",
                    format!("{:?}", row.source).to_lowercase(),
                    format!("{:?}", row.destination).to_lowercase()
                );
                println!("  topic/node: {}", row.topic_or_node);
                println!("  error: {}", row.error_message);
                println!("  failed at: {}", format_millis(row.failed_at));
                println!("  retries: {}", row.retry_count);
            }
        }
        Command::Cleanup { days } => {
            let cutoff = now_millis() - i64::from(days) * 24 * 3600 * 1000;
            let removed = store.cleanup(cutoff).await?;
            println!("removed {removed} completed messages older than {days} days");
        }
        Command::Reset => {
            let reset = store.reset_processing().await?;
            println!("returned {reset} processing messages to pending");
        }
        Command::Export { output } => {
            let counts = store.status_counts().await?;
            let history = store.metric_history().await?;
            let failed = store.failed_archive(100).await?;
            let dump = json!({
                "generated_at": format_millis(now_millis()),
                "status_counts": counts,
                "metrics": history,
                "failed_messages": failed,
            });
            let text = serde_json::to_string_pretty(&dump).map_err(|err| {
                BridgeError::Integrity(format!("cannot serialise export: {err}"))
            })?;
            std::fs::write(&output, text).map_err(|err| {
                BridgeError::StoreUnavailable(sqlx::Error::Io(err))
            })?;
            println!("exported statistics to {}", output.display());
        }
    }

    store.close().await;
    Ok(())
}

async fn print_stats(store: &Store) -> Result<(), BridgeError> {
    let counts = store.status_counts().await?;
    println!("\nmessages by status:");
    println!("  pending     {:>8}", counts.pending);
    println!("  processing  {:>8}", counts.processing);
    println!("  completed   {:>8}", counts.completed);
    println!("  failed      {:>8}", counts.failed);
    println!("  expired     {:>8}", counts.expired);
    println!("  total       {:>8}", counts.total());

    let mut priority_lines = Vec::new();
    for (label, priority) in [
        ("critical", telebridge::Priority::Critical),
        ("high", telebridge::Priority::High),
        ("normal", telebridge::Priority::Normal),
        ("low", telebridge::Priority::Low),
    ] {
        let count = store.pending_count_at(priority).await?;
        if count > 0 {
            priority_lines.push(format!("  {label:<10} {count:>8}"));
        }
    }
    if !priority_lines.is_empty() {
        println!("\npending by priority:");
        for line in priority_lines {
            println!("{line}");
        }
    }

    let routes = store.route_counts().await?;
    if !routes.is_empty() {
        println!("\nactive routes:");
        for route in routes {
            println!(
                "  {:<8} -> {:<8} {:>6}",
                route.source, route.destination, route.count
            );
        }
    }

    if let Some(oldest) = store.oldest_pending().await? {
        println!("\noldest pending: {}", format_millis(oldest));
    }

    let archived = store.failed_archive_count().await?;
    if archived > 0 {
        println!("archived failures: {archived}");
    }

    let snapshot = store.latest_snapshot().await?;
    if !snapshot.is_empty() {
        println!(
            "\nlast snapshot ({}):",
            format_millis(snapshot[0].timestamp)
        );
        for row in snapshot {
            println!("  {:<24} {:>10.1}", row.metric_name, row.metric_value);
        }
    }

    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_owned()
    } else {
        let kept: String = text.chars().take(width.saturating_sub(2)).collect();
        format!("{kept}..")
    }
}
