//! Periodic sweep that returns expired leases to the queue.
//!
//! Every [`Worker`](crate::Worker) runs one by default. Jobs whose holder
//! crashed or stalled past the visibility timeout become ready again with
//! their attempt count unchanged.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::queue::Queue;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reclaimer {
    queue: Queue,
    interval: Duration,
}

impl Reclaimer {
    pub fn new(queue: Queue, interval: Duration) -> Self {
        Self {
            queue,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// One sweep. Returns the number of leases reclaimed.
    pub async fn sweep(&self) -> Result<u64> {
        self.queue.reclaim().await
    }

    /// Sweep every interval until `shutdown` fires, reporting each result.
    ///
    /// The first sweep happens one interval after start.
    pub async fn run_until<F>(self, shutdown: CancellationToken, mut on_sweep: F)
    where
        F: FnMut(Result<u64>) + Send,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.sweep() => result,
                    };
                    on_sweep(result);
                }
            }
        }
        debug!(namespace = self.queue.namespace(), "reclaimer stopped");
    }
}
