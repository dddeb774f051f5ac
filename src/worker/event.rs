//! Lifecycle events published by a [`Worker`](super::Worker).

use std::time::Duration;

/// Capacity of each worker's event channel. Slow subscribers lag and skip.
pub(crate) const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The loop has started.
    Ready,
    /// A job was reserved and handed to the handler.
    Active { job_id: String, group_id: String },
    Completed {
        job_id: String,
        group_id: String,
        duration: Duration,
    },
    /// The handler failed. `will_retry` is false once the job is abandoned.
    Failed {
        job_id: String,
        group_id: String,
        attempts: u32,
        will_retry: bool,
        error: String,
    },
    /// Expired leases returned to the queue by the cleanup sweep.
    Reclaimed { count: u64 },
    /// A store or protocol error outside any handler.
    Error { message: String },
    /// The loop has exited.
    Closed,
}
