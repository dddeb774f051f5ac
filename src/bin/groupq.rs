//! groupq CLI: operator interface to a queue namespace.

use std::time::Duration;

use clap::{Parser, Subcommand};
use groupq::config::Config;
use groupq::telemetry::{TelemetryConfig, init_telemetry};
use groupq::{NewJob, Queue};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "groupq", about = "Inspect and feed a grouped work queue")]
struct Cli {
    /// Namespace to operate on (overrides GROUPQ_NAMESPACE)
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job
    Add {
        /// Group the job belongs to
        group: String,
        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,
        /// Order key in epoch ms (defaults to now)
        #[arg(long)]
        order_ms: Option<i64>,
        /// Attempts before the job is abandoned
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show job counts
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Also list job ids by state
        #[arg(long)]
        jobs: bool,
    },
    /// Print counts periodically until interrupted
    Monitor {
        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Return expired leases to the queue once
    Reclaim,
    /// List groups that hold jobs
    Groups,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "groupq-cli"))?;

    let queue = Queue::connect(
        config.redis_url.expose_secret(),
        &config.namespace,
        config.queue_options(),
    )
    .await?;

    match cli.command {
        Command::Add {
            group,
            payload,
            order_ms,
            max_attempts,
        } => cmd_add(&queue, group, payload, order_ms, max_attempts).await,
        Command::Stats { json, jobs } => cmd_stats(&queue, json, jobs).await,
        Command::Monitor { interval_ms } => cmd_monitor(&queue, interval_ms).await,
        Command::Reclaim => {
            let reclaimed = queue.reclaim().await?;
            println!("Reclaimed {reclaimed} expired lease(s)");
            Ok(())
        }
        Command::Groups => {
            for group in queue.unique_groups().await? {
                println!("{group}");
            }
            Ok(())
        }
    }
}

async fn cmd_add(
    queue: &Queue,
    group: String,
    payload: String,
    order_ms: Option<i64>,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)
        .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?;

    let mut job = NewJob::new(group, payload);
    if let Some(order_ms) = order_ms {
        job = job.order_ms(order_ms);
    }
    if let Some(max_attempts) = max_attempts {
        job = job.max_attempts(max_attempts);
    }

    let id = queue.add(job).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_stats(queue: &Queue, json: bool, with_jobs: bool) -> anyhow::Result<()> {
    let counts = queue.counts().await?;
    let jobs = if with_jobs {
        Some(queue.jobs().await?)
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "namespace": queue.namespace(),
            "counts": counts,
            "jobs": jobs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Namespace:     {}", queue.namespace());
    println!("Active:        {}", counts.active);
    println!("Waiting:       {}", counts.waiting);
    println!("Delayed:       {}", counts.delayed);
    println!("Total:         {}", counts.total);
    println!("Groups:        {}", counts.unique_groups);

    if let Some(jobs) = jobs {
        for (state, ids) in [
            ("active", &jobs.active),
            ("waiting", &jobs.waiting),
            ("delayed", &jobs.delayed),
        ] {
            println!();
            println!("{state} ({})", ids.len());
            for id in ids {
                println!("  {id}");
            }
        }
    }
    Ok(())
}

async fn cmd_monitor(queue: &Queue, interval_ms: u64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    println!(
        "{:<24} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "time", "active", "waiting", "delayed", "total", "groups"
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let counts = queue.counts().await?;
                println!(
                    "{:<24} {:>8} {:>8} {:>8} {:>8} {:>8}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    counts.active,
                    counts.waiting,
                    counts.delayed,
                    counts.total,
                    counts.unique_groups,
                );
            }
        }
    }
}
