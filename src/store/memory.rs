//! In-process store adapter.
//!
//! Mirrors the Redis scripts transition for transition, with one async
//! mutex held across each transition standing in for Redis's single-threaded
//! script execution. Clones share state, so several queues and workers can
//! contend on one namespace inside a test.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::keys;
use super::{
    Backend, NewRecord, RawJob, ReserveRequest, RetryOutcome, RetryRequest, Waiter, offset_ms,
};
use crate::error::Result;
use crate::model::{JobsByState, QueueCounts};

/// Promoted delayed groups per reservation, as in the Redis script.
const PROMOTE_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Sorted set
// ---------------------------------------------------------------------------

/// Members ordered by `(score, member)`, like a Redis zset.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    fn first(&self) -> Option<(i64, &str)> {
        self.ordered.first().map(|(s, m)| (*s, m.as_str()))
    }

    fn pop_first(&mut self) -> Option<(i64, String)> {
        let (score, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some((score, member))
    }

    /// Members scored at most `max`, lowest first.
    fn up_to(&self, max: i64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(s, _)| *s <= max)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Members scored strictly below `bound`, lowest first.
    fn below(&self, bound: i64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(s, _)| *s < bound)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn members(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|(_, m)| m.as_str())
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    group_id: String,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct State {
    seq: u64,
    jobs: HashMap<String, HashMap<String, String>>,
    groups: HashMap<String, SortedSet>,
    ready: SortedSet,
    delayed: SortedSet,
    processing: SortedSet,
    leases: HashMap<String, Lease>,
}

impl State {
    fn head(&self, group_id: &str) -> Option<(i64, String)> {
        self.groups
            .get(group_id)
            .and_then(|g| g.first())
            .map(|(s, m)| (s, m.to_string()))
    }

    fn remove_from_group(&mut self, group_id: &str, job_id: &str) {
        if let Some(group) = self.groups.get_mut(group_id) {
            group.remove(job_id);
        }
    }

    /// Re-insert a group behind its head, or forget it once empty.
    /// Returns whether the group became ready.
    fn advance(&mut self, group_id: &str) -> bool {
        match self.head(group_id) {
            Some((score, _)) => {
                self.ready.insert(group_id, score);
                true
            }
            None => {
                self.groups.remove(group_id);
                false
            }
        }
    }

    fn take_lease(&mut self, job_id: &str, token: &str) -> Option<Lease> {
        if self.leases.get(job_id)?.token != token {
            return None;
        }
        self.processing.remove(job_id);
        self.leases.remove(job_id)
    }

    fn group_of(&self, lease: Option<&Lease>, job_id: &str) -> Option<String> {
        lease
            .map(|l| l.group_id.clone())
            .or_else(|| self.jobs.get(job_id)?.get("groupId").cloned())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Backend holding all queue state in process memory.
#[derive(Clone)]
pub struct MemoryBackend {
    namespace: String,
    state: Arc<Mutex<State>>,
    signal: Arc<Notify>,
}

impl MemoryBackend {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Arc::new(Mutex::new(State::default())),
            signal: Arc::new(Notify::new()),
        }
    }

    /// Write a record verbatim, bypassing enqueue validation, and make its
    /// group ready. Used to simulate partially-written or corrupted state.
    pub async fn insert_raw(
        &self,
        group_id: &str,
        job_id: &str,
        score: i64,
        fields: HashMap<String, String>,
    ) {
        let mut state = self.state.lock().await;
        state.jobs.insert(job_id.to_string(), fields);
        state
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(job_id, score);
        state.ready.insert(group_id, score);
    }

    /// Number of stored job records, leased or not.
    pub async fn record_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    fn wake(&self) {
        self.signal.notify_one();
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn enqueue(&self, record: NewRecord) -> Result<String> {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let seq = state.seq;
        let job_id = keys::job_id(seq, &record.id_suffix);

        let fields = HashMap::from([
            ("id".to_string(), job_id.clone()),
            ("groupId".to_string(), record.group_id.clone()),
            ("payload".to_string(), record.payload),
            ("attempts".to_string(), "0".to_string()),
            ("maxAttempts".to_string(), record.max_attempts.to_string()),
            ("seq".to_string(), seq.to_string()),
            ("enqueuedAt".to_string(), record.enqueued_at.to_string()),
            ("orderMs".to_string(), record.order_ms.to_string()),
        ]);
        state.jobs.insert(job_id.clone(), fields);

        let group = state.groups.entry(record.group_id.clone()).or_default();
        group.insert(&job_id, record.order_ms);
        let only_job = group.len() == 1;

        if only_job {
            state.ready.insert(&record.group_id, record.order_ms);
        } else if state.ready.contains(&record.group_id) {
            if let Some((score, _)) = state.head(&record.group_id) {
                state.ready.insert(&record.group_id, score);
            }
        }

        self.wake();
        Ok(job_id)
    }

    async fn reserve(&self, req: ReserveRequest) -> Result<Option<RawJob>> {
        let mut state = self.state.lock().await;
        let now = req.now_ms;

        for group_id in state.delayed.up_to(now, PROMOTE_BATCH) {
            state.delayed.remove(&group_id);
            if let Some((score, _)) = state.head(&group_id) {
                state.ready.insert(&group_id, score);
            }
        }

        for _ in 0..req.scan_limit.max(1) {
            let Some((_, group_id)) = state.ready.pop_first() else {
                return Ok(None);
            };
            let Some((_, job_id)) = state.head(&group_id) else {
                state.groups.remove(&group_id);
                continue;
            };

            if state
                .leases
                .get(&job_id)
                .is_some_and(|lease| lease.expires_at > now)
            {
                continue;
            }

            let Some(fields) = state.jobs.get(&job_id).cloned() else {
                state.remove_from_group(&group_id, &job_id);
                state.advance(&group_id);
                continue;
            };

            let mut eligible_at = now;
            if req.ordering_delay_ms > 0 {
                if let Some(order_ms) = fields.get("orderMs").and_then(|v| v.parse::<i64>().ok()) {
                    eligible_at = if order_ms > now {
                        order_ms
                    } else {
                        offset_ms(order_ms, req.ordering_delay_ms)
                    };
                }
            }
            if eligible_at > now {
                state.delayed.insert(&group_id, eligible_at);
                continue;
            }

            let deadline = offset_ms(now, req.visibility_timeout_ms);
            state.leases.insert(
                job_id.clone(),
                Lease {
                    token: req.token.clone(),
                    group_id: group_id.clone(),
                    expires_at: deadline,
                },
            );
            state.processing.insert(&job_id, deadline);

            return Ok(Some(RawJob {
                id: job_id,
                group_id,
                deadline_at: deadline,
                fields,
            }));
        }

        Ok(None)
    }

    async fn complete(&self, job_id: &str, token: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(lease) = state.take_lease(job_id, token) else {
            return Ok(false);
        };
        let group_id = state.group_of(Some(&lease), job_id);
        state.jobs.remove(job_id);
        if let Some(group_id) = group_id {
            state.remove_from_group(&group_id, job_id);
            if state.advance(&group_id) {
                self.wake();
            }
        }
        Ok(true)
    }

    async fn retry(&self, req: RetryRequest<'_>) -> Result<RetryOutcome> {
        let mut state = self.state.lock().await;
        let Some(lease) = state.take_lease(req.job_id, req.token) else {
            return Ok(RetryOutcome::Stale);
        };
        let Some(group_id) = state.group_of(Some(&lease), req.job_id) else {
            state.jobs.remove(req.job_id);
            return Ok(RetryOutcome::Stale);
        };

        let Some(fields) = state.jobs.get(req.job_id) else {
            state.remove_from_group(&group_id, req.job_id);
            if state.advance(&group_id) {
                self.wake();
            }
            return Ok(RetryOutcome::Stale);
        };

        let attempts = fields
            .get("attempts")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        if attempts >= req.max_attempts {
            state.jobs.remove(req.job_id);
            state.remove_from_group(&group_id, req.job_id);
            if state.advance(&group_id) {
                self.wake();
            }
            return Ok(RetryOutcome::Abandoned { attempts });
        }

        if let Some(fields) = state.jobs.get_mut(req.job_id) {
            fields.insert("attempts".to_string(), attempts.to_string());
        }
        if req.backoff_ms > 0 {
            state
                .delayed
                .insert(&group_id, offset_ms(req.now_ms, req.backoff_ms));
        } else if state.advance(&group_id) {
            self.wake();
        }
        Ok(RetryOutcome::Retrying { attempts })
    }

    async fn heartbeat(&self, job_id: &str, token: &str, expires_at: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(job_id) {
            Some(lease) if lease.token == token => {
                lease.expires_at = expires_at;
                state.processing.insert(job_id, expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim(&self, now_ms: i64, limit: u32) -> Result<u64> {
        let mut state = self.state.lock().await;
        let expired = state.processing.below(now_ms, limit.max(1) as usize);
        let mut reclaimed = 0;
        for job_id in expired {
            state.processing.remove(&job_id);
            let lease = state.leases.remove(&job_id);
            if let Some(group_id) = state.group_of(lease.as_ref(), &job_id) {
                if !state.jobs.contains_key(&job_id) {
                    state.remove_from_group(&group_id, &job_id);
                }
                state.delayed.remove(&group_id);
                if state.advance(&group_id) {
                    self.wake();
                }
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn next_delayed_at(&self) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state.delayed.first().map(|(score, _)| score))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let active = state.processing.len() as u64;
        let mut waiting = 0u64;
        let mut delayed = 0u64;
        let mut unique_groups = 0u64;
        for (group_id, group) in &state.groups {
            if group.is_empty() {
                continue;
            }
            unique_groups += 1;
            if state.delayed.contains(group_id) {
                delayed += group.len() as u64;
            } else {
                waiting += group.len() as u64;
            }
        }
        let waiting = waiting.saturating_sub(active);
        Ok(QueueCounts {
            active,
            waiting,
            delayed,
            total: active + waiting + delayed,
            unique_groups,
        })
    }

    async fn jobs(&self) -> Result<JobsByState> {
        let state = self.state.lock().await;
        let mut jobs = JobsByState {
            active: state.processing.members().map(str::to_string).collect(),
            ..Default::default()
        };
        for (group_id, group) in &state.groups {
            let is_delayed = state.delayed.contains(group_id);
            for job_id in group.members() {
                if is_delayed {
                    jobs.delayed.push(job_id.to_string());
                } else if !state.leases.contains_key(job_id) {
                    jobs.waiting.push(job_id.to_string());
                }
            }
        }
        Ok(jobs)
    }

    async fn groups(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut groups: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, g)| !g.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn waiter(&self) -> Result<Box<dyn Waiter>> {
        Ok(Box::new(MemoryWaiter {
            signal: Arc::clone(&self.signal),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryWaiter {
    signal: Arc<Notify>,
}

#[async_trait]
impl Waiter for MemoryWaiter {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        Ok(tokio::time::timeout(timeout, self.signal.notified())
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_set_orders_by_score_then_member() {
        let mut set = SortedSet::default();
        set.insert("b", 5);
        set.insert("a", 5);
        set.insert("c", 1);
        set.insert("b", 0);
        let order: Vec<&str> = set.members().collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(set.up_to(1, 10), vec!["b", "c"]);
        assert_eq!(set.below(1, 10), vec!["b"]);
        assert_eq!(set.pop_first(), Some((0, "b".to_string())));
        assert!(!set.contains("b"));
        assert_eq!(set.len(), 2);
    }
}
