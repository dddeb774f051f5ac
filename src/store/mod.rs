//! Store adapters: the shared key-value store behind a queue.
//!
//! A [`Backend`] exposes one method per queue state transition. Each call is
//! a single atomic unit against the store, so any number of producers and
//! workers can run concurrently against one namespace without client-side
//! locks. [`redis::RedisBackend`] is the production adapter;
//! [`memory::MemoryBackend`] mirrors the same transitions in-process.

pub mod keys;
pub mod memory;
pub mod redis;
pub mod scripts;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{JobsByState, QueueCounts};

/// Latest timestamp written as a sorted-set score. Scores are doubles, so
/// larger integers would lose precision.
pub const MAX_SCORE_MS: i64 = (1 << 53) - 1;

/// `at + ms`, saturating at [`MAX_SCORE_MS`].
pub fn offset_ms(at: i64, ms: u64) -> i64 {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    at.saturating_add(ms).min(MAX_SCORE_MS)
}

/// Whole milliseconds in `d`, saturating.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A job record ready to be written by [`Backend::enqueue`].
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub group_id: String,
    /// Already-serialized JSON payload.
    pub payload: String,
    pub order_ms: i64,
    pub max_attempts: u32,
    pub enqueued_at: i64,
    /// Opaque part of the job id; the store prepends the sequence number.
    pub id_suffix: String,
}

/// Arguments of one reservation attempt.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub now_ms: i64,
    pub visibility_timeout_ms: u64,
    pub token: String,
    pub scan_limit: u32,
    pub ordering_delay_ms: u64,
}

/// Arguments of a failure report.
#[derive(Debug, Clone)]
pub struct RetryRequest<'a> {
    pub job_id: &'a str,
    pub token: &'a str,
    pub backoff_ms: u64,
    /// Attempts allowed; reaching it abandons the job.
    pub max_attempts: u32,
    pub now_ms: i64,
}

/// A leased job record exactly as stored, before defensive parsing.
#[derive(Debug, Clone)]
pub struct RawJob {
    pub id: String,
    pub group_id: String,
    pub deadline_at: i64,
    pub fields: HashMap<String, String>,
}

/// What a failure report did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back at the head of its group, to be re-delivered after the backoff.
    Retrying { attempts: u32 },
    /// Out of attempts: removed, and its group advanced.
    Abandoned { attempts: u32 },
    /// The lease was no longer ours (reclaimed or re-reserved); nothing changed.
    Stale,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Namespace this backend is bound to.
    fn namespace(&self) -> &str;

    /// Write a job and make its group visible. Returns the job id.
    async fn enqueue(&self, record: NewRecord) -> Result<String>;

    /// Lease the head job of the next ready group.
    async fn reserve(&self, req: ReserveRequest) -> Result<Option<RawJob>>;

    /// Delete a leased job and advance its group. `false` if the lease was stale.
    async fn complete(&self, job_id: &str, token: &str) -> Result<bool>;

    /// Record a failed attempt.
    async fn retry(&self, req: RetryRequest<'_>) -> Result<RetryOutcome>;

    /// Move a lease's expiry. `false` if the lease was stale.
    async fn heartbeat(&self, job_id: &str, token: &str, expires_at: i64) -> Result<bool>;

    /// Return up to `limit` jobs whose lease expired before `now_ms` to the
    /// ready state. Returns how many leases were reclaimed.
    async fn reclaim(&self, now_ms: i64, limit: u32) -> Result<u64>;

    /// Earliest time a delayed group becomes reservable, if any.
    async fn next_delayed_at(&self) -> Result<Option<i64>>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn jobs(&self) -> Result<JobsByState>;

    /// Group ids that currently hold jobs, sorted.
    async fn groups(&self) -> Result<Vec<String>>;

    /// A handle for blocking until producers signal new work.
    ///
    /// Each worker should hold its own: a blocked waiter may tie up a
    /// connection.
    async fn waiter(&self) -> Result<Box<dyn Waiter>>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait Waiter: Send {
    /// Wait for a wake-up signal for at most `timeout`. `true` if signalled.
    ///
    /// Never mutates queue state, so dropping the future is harmless.
    async fn wait(&mut self, timeout: Duration) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_saturate_at_max_score() {
        assert_eq!(offset_ms(1_000, 500), 1_500);
        assert_eq!(offset_ms(1_000, u64::MAX), MAX_SCORE_MS);
        assert_eq!(offset_ms(i64::MAX, 1), MAX_SCORE_MS);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
        assert_eq!(duration_ms(Duration::from_millis(42)), 42);
    }
}
