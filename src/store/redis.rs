//! Redis store adapter.
//!
//! Queue operations go through a [`ConnectionManager`], which reconnects on
//! its own after the server goes away; while it is down every operation
//! fails with [`Error::Store`](crate::error::Error::Store). Blocking waits
//! get a dedicated multiplexed connection per waiter so a blocked `BLPOP`
//! never stalls other commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use async_trait::async_trait;
use tracing::debug;

use super::keys::Keys;
use super::scripts::Scripts;
use super::{Backend, NewRecord, RawJob, ReserveRequest, RetryOutcome, RetryRequest, Waiter};
use crate::error::{Error, Result};
use crate::model::{JobsByState, QueueCounts};

/// Shortest wait handed to `BLPOP`; a zero timeout would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

type ReserveReply = Option<(String, String, i64, Vec<Vec<u8>>)>;

/// Backend over a shared Redis server.
#[derive(Clone)]
pub struct RedisBackend {
    client: ::redis::Client,
    conn: ConnectionManager,
    keys: Keys,
    namespace: String,
    scripts: Arc<Scripts>,
}

impl RedisBackend {
    /// Connect to Redis and bind to `namespace`.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(namespace, "connected to redis");
        Ok(Self {
            client,
            conn,
            keys: Keys::new(namespace),
            namespace: namespace.to_string(),
            scripts: Arc::new(Scripts::new()),
        })
    }

    /// Another backend on the same namespace with its own connection.
    pub async fn duplicate(&self) -> Result<Self> {
        let conn = self.client.get_connection_manager().await?;
        Ok(Self {
            conn,
            ..self.clone()
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// A connection handle for direct commands (tests, tooling).
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn enqueue(&self, record: NewRecord) -> Result<String> {
        let mut conn = self.conn.clone();
        let job_id: String = self
            .scripts
            .enqueue
            .arg(self.keys.ns())
            .arg(&record.group_id)
            .arg(&record.payload)
            .arg(record.max_attempts)
            .arg(record.order_ms)
            .arg(record.enqueued_at)
            .arg(&record.id_suffix)
            .invoke_async(&mut conn)
            .await?;
        Ok(job_id)
    }

    async fn reserve(&self, req: ReserveRequest) -> Result<Option<RawJob>> {
        let mut conn = self.conn.clone();
        let reply: ReserveReply = self
            .scripts
            .reserve
            .arg(self.keys.ns())
            .arg(req.now_ms)
            .arg(req.visibility_timeout_ms)
            .arg(&req.token)
            .arg(req.scan_limit.max(1))
            .arg(req.ordering_delay_ms)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, group_id, deadline_at, flat)) = reply else {
            return Ok(None);
        };
        if flat.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "job {id}: odd number of record fields"
            )));
        }
        let fields: HashMap<String, String> = flat
            .chunks(2)
            .map(|pair| {
                (
                    String::from_utf8_lossy(&pair[0]).into_owned(),
                    String::from_utf8_lossy(&pair[1]).into_owned(),
                )
            })
            .collect();

        Ok(Some(RawJob {
            id,
            group_id,
            deadline_at,
            fields,
        }))
    }

    async fn complete(&self, job_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let done: i64 = self
            .scripts
            .complete
            .arg(self.keys.ns())
            .arg(job_id)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn retry(&self, req: RetryRequest<'_>) -> Result<RetryOutcome> {
        let mut conn = self.conn.clone();
        let (status, attempts): (i64, u32) = self
            .scripts
            .retry
            .arg(self.keys.ns())
            .arg(req.job_id)
            .arg(req.token)
            .arg(req.backoff_ms)
            .arg(req.max_attempts)
            .arg(req.now_ms)
            .invoke_async(&mut conn)
            .await?;
        match status {
            0 => Ok(RetryOutcome::Stale),
            1 => Ok(RetryOutcome::Retrying { attempts }),
            2 => Ok(RetryOutcome::Abandoned { attempts }),
            other => Err(Error::Protocol(format!("retry returned status {other}"))),
        }
    }

    async fn heartbeat(&self, job_id: &str, token: &str, expires_at: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .heartbeat
            .arg(self.keys.ns())
            .arg(job_id)
            .arg(token)
            .arg(expires_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn reclaim(&self, now_ms: i64, limit: u32) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reclaimed: u64 = self
            .scripts
            .reclaim
            .arg(self.keys.ns())
            .arg(now_ms)
            .arg(limit.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(reclaimed)
    }

    async fn next_delayed_at(&self) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let head: Vec<(String, f64)> = ::redis::cmd("ZRANGE")
            .arg(self.keys.delayed())
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn.clone();
        let (active, waiting, delayed, unique_groups): (u64, u64, u64, u64) = self
            .scripts
            .counts
            .arg(self.keys.ns())
            .invoke_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            active,
            waiting,
            delayed,
            total: active + waiting + delayed,
            unique_groups,
        })
    }

    async fn jobs(&self) -> Result<JobsByState> {
        let mut conn = self.conn.clone();
        let (active, waiting, delayed): (Vec<String>, Vec<String>, Vec<String>) = self
            .scripts
            .jobs
            .arg(self.keys.ns())
            .invoke_async(&mut conn)
            .await?;
        Ok(JobsByState {
            active,
            waiting,
            delayed,
        })
    }

    async fn groups(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut groups: Vec<String> = ::redis::cmd("SMEMBERS")
            .arg(self.keys.groups())
            .query_async(&mut conn)
            .await?;
        groups.sort();
        Ok(groups)
    }

    async fn waiter(&self) -> Result<Box<dyn Waiter>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisWaiter {
            conn,
            key: self.keys.signal(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Blocks on `BLPOP <ns>:signal` over its own connection.
struct RedisWaiter {
    conn: MultiplexedConnection,
    key: String,
}

#[async_trait]
impl Waiter for RedisWaiter {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let secs = timeout.as_secs_f64().max(MIN_BLOCK_SECS);
        let popped: Option<(String, String)> = ::redis::cmd("BLPOP")
            .arg(&self.key)
            .arg(secs)
            .query_async(&mut self.conn)
            .await?;
        Ok(popped.is_some())
    }
}
