//! The queue handle: enqueue, reserve, and settle jobs.
//!
//! A [`Queue`] is a cheap, cloneable handle over a [`Backend`]. Every method
//! that changes state maps to exactly one atomic backend transition.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Job, JobsByState, NewJob, QueueCounts};
use crate::store::memory::MemoryBackend;
use crate::store::redis::RedisBackend;
use crate::store::{
    Backend, NewRecord, ReserveRequest, RetryOutcome, RetryRequest, Waiter, duration_ms, offset_ms,
};
use crate::telemetry::metrics;

pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RESERVE_SCAN_LIMIT: u32 = 20;

/// Expired leases handled per reclaim sweep.
const RECLAIM_BATCH: u32 = 1_000;

/// Poll interval of [`Queue::wait_for_empty`].
const EMPTY_POLL: Duration = Duration::from_millis(100);

/// Queue-wide settings.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Lease duration. Zero is legal (the lease is expired as soon as it is
    /// taken); negative values fall back to [`DEFAULT_VISIBILITY_TIMEOUT_MS`].
    pub visibility_timeout_ms: i64,
    /// Attempts allowed for jobs that do not set their own.
    pub max_attempts: u32,
    /// Ready groups a reservation may skip past before giving up.
    pub reserve_scan_limit: u32,
    /// Hold each job back until `order_ms + ordering_delay_ms`, giving late
    /// events a chance to slot in ahead of it. Zero disables the delay.
    pub ordering_delay_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS as i64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reserve_scan_limit: DEFAULT_RESERVE_SCAN_LIMIT,
            ordering_delay_ms: 0,
        }
    }
}

/// Clamp a configured visibility timeout to a usable lease duration.
pub fn effective_visibility_timeout(ms: i64) -> u64 {
    if ms < 0 {
        DEFAULT_VISIBILITY_TIMEOUT_MS
    } else {
        ms as u64
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to one namespace of a grouped work queue.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn Backend>,
    visibility_timeout_ms: u64,
    max_attempts: u32,
    scan_limit: u32,
    ordering_delay_ms: u64,
}

impl Queue {
    /// Connect to Redis and open `namespace`.
    pub async fn connect(url: &str, namespace: &str, options: QueueOptions) -> Result<Self> {
        let backend = RedisBackend::connect(url, namespace).await?;
        Ok(Self::with_backend(Arc::new(backend), options))
    }

    /// A queue over fresh in-process state (for testing).
    pub fn in_memory(namespace: &str, options: QueueOptions) -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new(namespace)), options)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, options: QueueOptions) -> Self {
        Self {
            backend,
            visibility_timeout_ms: effective_visibility_timeout(options.visibility_timeout_ms),
            max_attempts: options.max_attempts.max(1),
            scan_limit: options.reserve_scan_limit.max(1),
            ordering_delay_ms: options.ordering_delay_ms,
        }
    }

    /// The same queue, leasing jobs for `ms` instead.
    pub fn with_visibility_timeout_ms(&self, ms: i64) -> Self {
        Self {
            visibility_timeout_ms: effective_visibility_timeout(ms),
            ..self.clone()
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn namespace(&self) -> &str {
        self.backend.namespace()
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("namespace", self.namespace().to_string())]
    }

    // -----------------------------------------------------------------------
    // Producer
    // -----------------------------------------------------------------------

    /// Append a job to its group. Returns the job id.
    ///
    /// The payload is serialized before anything is written, so a payload
    /// that cannot be represented as JSON fails with
    /// [`Error::Serialization`](crate::Error::Serialization) and leaves the
    /// store untouched. `None` payloads are stored as `null`.
    pub async fn add<P: Serialize>(&self, job: NewJob<P>) -> Result<String> {
        let payload = serde_json::to_string(&job.payload)?;
        let now = now_ms();
        let suffix = Uuid::new_v4().simple().to_string();

        let record = NewRecord {
            group_id: job.group_id,
            payload,
            order_ms: job.order_ms.unwrap_or(now),
            max_attempts: job.max_attempts.unwrap_or(self.max_attempts).max(1),
            enqueued_at: now,
            id_suffix: suffix[..8].to_string(),
        };
        let group_id = record.group_id.clone();
        let job_id = self.backend.enqueue(record).await?;

        metrics::jobs_enqueued().add(1, &self.labels());
        debug!(namespace = self.namespace(), %job_id, %group_id, "job enqueued");
        Ok(job_id)
    }

    // -----------------------------------------------------------------------
    // Reservation
    // -----------------------------------------------------------------------

    /// Lease the head job of the next ready group, or `None` when no group
    /// has reservable work.
    pub async fn reserve(&self) -> Result<Option<Job>> {
        let token = Uuid::new_v4().to_string();
        let raw = self
            .backend
            .reserve(ReserveRequest {
                now_ms: now_ms(),
                visibility_timeout_ms: self.visibility_timeout_ms,
                token: token.clone(),
                scan_limit: self.scan_limit,
                ordering_delay_ms: self.ordering_delay_ms,
            })
            .await?;

        Ok(raw.map(|raw| {
            metrics::jobs_reserved().add(1, &self.labels());
            Job::from_raw(raw, token, self.max_attempts)
        }))
    }

    /// A dedicated handle for [`reserve_blocking`](Self::reserve_blocking).
    pub async fn waiter(&self) -> Result<Box<dyn Waiter>> {
        self.backend.waiter().await
    }

    /// Block for up to `timeout` until producers signal new work.
    ///
    /// The wait is cut short when a delayed group comes due earlier. This
    /// only waits; it never changes queue state and is safe to cancel.
    pub async fn wait_for_work(&self, waiter: &mut dyn Waiter, timeout: Duration) -> Result<bool> {
        let mut budget = timeout;
        if let Some(due) = self.backend.next_delayed_at().await? {
            let until_due = (due - now_ms()).max(0) as u64;
            budget = budget.min(Duration::from_millis(until_due));
        }
        if budget.is_zero() {
            return Ok(true);
        }
        waiter.wait(budget).await
    }

    /// Reserve, waiting up to `timeout` for work if none is ready.
    pub async fn reserve_blocking(
        &self,
        waiter: &mut dyn Waiter,
        timeout: Duration,
    ) -> Result<Option<Job>> {
        if let Some(job) = self.reserve().await? {
            return Ok(Some(job));
        }
        self.wait_for_work(waiter, timeout).await?;
        self.reserve().await
    }

    // -----------------------------------------------------------------------
    // Completion & retry
    // -----------------------------------------------------------------------

    /// Acknowledge a job: delete it and advance its group.
    ///
    /// Returns `false` if the lease had already been reclaimed, in which case
    /// the job will be delivered again.
    pub async fn complete(&self, job: &Job) -> Result<bool> {
        let done = self.backend.complete(&job.id, &job.token).await?;
        if done {
            metrics::jobs_completed().add(1, &self.labels());
        } else {
            warn!(job_id = %job.id, group_id = %job.group_id, "completion ignored, lease no longer held");
        }
        Ok(done)
    }

    /// Record a failed attempt, abandoning the job once `max_attempts` is
    /// reached. Below the limit the job stays at the head of its group and
    /// becomes reservable again after `backoff`.
    pub async fn retry(
        &self,
        job: &Job,
        backoff: Duration,
        max_attempts: u32,
    ) -> Result<RetryOutcome> {
        let outcome = self
            .backend
            .retry(RetryRequest {
                job_id: &job.id,
                token: &job.token,
                backoff_ms: duration_ms(backoff),
                max_attempts: max_attempts.max(1),
                now_ms: now_ms(),
            })
            .await?;

        match outcome {
            RetryOutcome::Retrying { .. } => metrics::jobs_retried().add(1, &self.labels()),
            RetryOutcome::Abandoned { .. } => metrics::jobs_abandoned().add(1, &self.labels()),
            RetryOutcome::Stale => {
                warn!(job_id = %job.id, group_id = %job.group_id, "failure ignored, lease no longer held")
            }
        }
        Ok(outcome)
    }

    /// Push the job's lease expiry to `now + extend`.
    pub async fn heartbeat(&self, job: &Job, extend: Duration) -> Result<bool> {
        let expires_at = offset_ms(now_ms(), duration_ms(extend));
        self.backend.heartbeat(&job.id, &job.token, expires_at).await
    }

    /// Return jobs whose lease has expired to the ready state.
    ///
    /// Attempts are not incremented: the holder never reported an outcome.
    pub async fn reclaim(&self) -> Result<u64> {
        let reclaimed = self.backend.reclaim(now_ms(), RECLAIM_BATCH).await?;
        if reclaimed > 0 {
            metrics::leases_reclaimed().add(reclaimed, &self.labels());
            info!(namespace = self.namespace(), reclaimed, "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.backend.counts().await
    }

    pub async fn jobs(&self) -> Result<JobsByState> {
        self.backend.jobs().await
    }

    pub async fn unique_groups(&self) -> Result<Vec<String>> {
        self.backend.groups().await
    }

    /// Wait until no job holds a lease. `false` if `timeout` ran out first.
    pub async fn wait_for_empty(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.counts().await?.active == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(EMPTY_POLL).await;
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.backend.ping().await
    }
}
