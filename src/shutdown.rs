//! Process-level graceful shutdown for services running workers.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::Result;
use crate::queue::Queue;
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// How long to wait for in-flight jobs to drain before stopping workers.
    pub queue_empty_timeout: Duration,
    /// Per-worker grace period for the handler it is running.
    pub worker_stop_timeout: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            queue_empty_timeout: Duration::from_secs(30),
            worker_stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM. Returns the signal name.
#[cfg(unix)]
pub async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT").map_err(Into::into),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Wait (bounded) for `queues` to have no leased jobs, then stop every
/// worker in parallel.
pub async fn graceful_shutdown(workers: &[Worker], queues: &[Queue], options: &ShutdownOptions) {
    for queue in queues {
        match queue.wait_for_empty(options.queue_empty_timeout).await {
            Ok(true) => {}
            Ok(false) => warn!(
                namespace = queue.namespace(),
                timeout_ms = options.queue_empty_timeout.as_millis() as u64,
                "queue still has active jobs, stopping workers anyway"
            ),
            Err(err) => warn!(namespace = queue.namespace(), error = %err, "could not read queue counts"),
        }
    }

    let mut stopping = JoinSet::new();
    for worker in workers {
        let worker = worker.clone();
        let timeout = options.worker_stop_timeout;
        stopping.spawn(async move { worker.stop(timeout).await });
    }
    while stopping.join_next().await.is_some() {}

    info!(workers = workers.len(), "all workers stopped");
}

/// Block until a shutdown signal arrives, then run [`graceful_shutdown`].
pub async fn run_until_signal(workers: &[Worker], queues: &[Queue], options: &ShutdownOptions) -> Result<()> {
    let signal = shutdown_signal().await?;
    info!(signal, "shutdown requested");
    graceful_shutdown(workers, queues, options).await;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub index: usize,
    pub name: String,
    pub job_id: Option<String>,
    pub group_id: Option<String>,
    pub processing_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkersStatus {
    pub total: usize,
    pub processing: usize,
    pub idle: usize,
    pub workers: Vec<WorkerStatus>,
}

/// Snapshot of what each worker is doing.
pub fn workers_status(workers: &[Worker]) -> WorkersStatus {
    let workers: Vec<WorkerStatus> = workers
        .iter()
        .enumerate()
        .map(|(index, worker)| {
            let current = worker.current_job();
            WorkerStatus {
                index,
                name: worker.name().to_string(),
                job_id: current.as_ref().map(|c| c.job.id.clone()),
                group_id: current.as_ref().map(|c| c.job.group_id.clone()),
                processing_ms: current.map(|c| c.processing_time.as_millis() as u64),
            }
        })
        .collect();
    let processing = workers.iter().filter(|w| w.job_id.is_some()).count();

    WorkersStatus {
        total: workers.len(),
        processing,
        idle: workers.len() - processing,
        workers,
    }
}
