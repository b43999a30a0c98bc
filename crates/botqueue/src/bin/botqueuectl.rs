use anyhow::Context;
use botqueue::queue::workflow;
use botqueue::queue::{
    AttemptsRepo, ItemFilter, ItemStatus, ItemStore, NewItem, Priority, QueueItem, RetryPolicy,
};
use botqueue::db::{self, PoolSettings};
use botqueue::telemetry;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::time::Duration;
use uuid::Uuid;

/// Operator tool for the bot's job queue.
#[derive(Parser)]
#[command(name = "botqueuectl", version)]
struct Cli {
    /// Falls back to DATABASE_URL, then TEST_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    /// Enqueue one item.
    Enqueue {
        task_type: String,
        /// JSON payload.
        payload: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long, default_value_t = 5)]
        max_attempts: i32,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        channel_id: Option<String>,
        #[arg(long)]
        correlation_id: Option<Uuid>,
        #[arg(long)]
        parent_id: Option<Uuid>,
        /// Delay before the item becomes claimable.
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// List items, newest first.
    List {
        #[arg(long)]
        status: Option<ItemStatus>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        correlation_id: Option<Uuid>,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Dead-lettered items awaiting inspection.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// One item with its attempt history and children.
    Show { id: Uuid },
    /// Every item of a workflow.
    Workflow { correlation_id: Uuid },
    /// Re-run a dead-lettered item as a new item.
    Replay {
        id: Uuid,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Dead-letter a queued item so it is never claimed.
    Quarantine {
        id: Uuid,
        #[arg(long, default_value = "quarantined by operator")]
        reason: String,
    },
    /// Reclaim items stuck in progress longer than the timeout.
    Reap {
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Item counts per status.
    Counts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init(false);

    let cli = Cli::parse();

    let url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .or_else(|| std::env::var("TEST_DATABASE_URL").ok())
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;

    let pool = db::make_pool(&url, &PoolSettings::default()).await?;
    let store = ItemStore::new(pool.clone());
    let attempts = AttemptsRepo::new(pool.clone());

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Command::Enqueue {
            task_type,
            payload,
            priority,
            max_attempts,
            user_id,
            channel_id,
            correlation_id,
            parent_id,
            delay_secs,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;

            let mut item = NewItem::new(task_type, priority, payload).max_attempts(max_attempts);
            item.user_id = user_id;
            item.channel_id = channel_id;
            item.correlation_id = correlation_id;
            item.parent_id = parent_id;
            item.scheduled_for = delay_secs.map(schedule_after).transpose()?;

            let id = store.enqueue(item).await?;
            println!("{id}");
        }
        Command::List {
            status,
            priority,
            correlation_id,
            task_type,
            limit,
        } => {
            let items = store
                .list(&ItemFilter {
                    status,
                    priority,
                    correlation_id,
                    task_type,
                    limit: Some(limit),
                    cursor: None,
                })
                .await?;
            print_items(&items);
        }
        Command::DeadLetters { limit } => {
            let items = store.dead_letters(limit).await?;
            print_items(&items);
            for item in &items {
                println!(
                    "  {} last_error={}",
                    item.id,
                    item.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Show { id } => match workflow::explain(&store, &attempts, id).await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => anyhow::bail!("item {id} not found"),
        },
        Command::Workflow { correlation_id } => {
            let trace = workflow::trace(&store, correlation_id).await?;
            print_items(&trace.items);
            println!(
                "total={} completed={} dead_letter={} in_flight={} settled={}",
                trace.summary.total,
                trace.summary.completed,
                trace.summary.dead_letter,
                trace.summary.queued + trace.summary.in_progress,
                trace.summary.is_settled()
            );
        }
        Command::Replay { id, at } => {
            let new_id = store.replay(id, at).await?;
            println!("{new_id}");
        }
        Command::Quarantine { id, reason } => {
            let item = store.dead_letter(id, None, &reason).await?;
            println!("{} -> {}", item.id, item.status);
        }
        Command::Reap { timeout_secs } => {
            let reaped = store
                .reap_stale(Duration::from_secs(timeout_secs), &RetryPolicy::default())
                .await?;
            for r in &reaped {
                println!(
                    "{} worker={} -> {}",
                    r.item.id,
                    r.stale_worker.as_deref().unwrap_or("-"),
                    r.item.status
                );
            }
            println!("reaped {}", reaped.len());
        }
        Command::Counts => {
            for c in store.status_counts().await? {
                println!("{:<12} {}", c.status.as_str(), c.count);
            }
        }
    }

    Ok(())
}

/// `now + secs`, rejecting delays chrono cannot represent.
fn schedule_after(secs: i64) -> anyhow::Result<DateTime<Utc>> {
    chrono::Duration::try_seconds(secs)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .with_context(|| format!("--delay-secs {secs} is out of range"))
}

fn print_items(items: &[QueueItem]) {
    for item in items {
        println!(
            "{} {:<11} {:<12} {:<16} attempts={}/{} scheduled_for={}",
            item.id,
            item.status.as_str(),
            item.priority.to_string(),
            item.task_type,
            item.attempt_count,
            item.max_attempts,
            item.scheduled_for.to_rfc3339(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_added_to_now() {
        let before = Utc::now();
        let at = schedule_after(90).unwrap();
        assert!(at >= before + chrono::Duration::seconds(90));
    }

    #[test]
    fn out_of_range_delay_is_an_error() {
        assert!(schedule_after(i64::MAX).is_err());
        assert!(schedule_after(i64::MIN).is_err());
    }
}
