//! The user-supplied side of a worker.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::Job;

/// Processes one job at a time. An `Err` (or a panic) counts as a failed
/// attempt; `Ok` acknowledges the job.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(job, ctx).await
    }
}

/// Called with errors that need attention: abandoned jobs (with the job)
/// and store failures outside any handler (without one).
pub type ErrorHook = Arc<dyn Fn(&anyhow::Error, Option<&Job>) + Send + Sync>;

/// Per-delivery context handed to the handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Fires when the job timeout elapses or the worker is stopping.
    ///
    /// Handlers are not interrupted; long-running ones should watch this and
    /// wind down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
