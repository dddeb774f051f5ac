//! Core data model.
//!
//! A job is an opaque JSON payload bound to a group. Jobs in the same group
//! are processed strictly in `(order_ms, seq)` order; groups are independent.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::RawJob;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A reserved job, as delivered to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// `<seq>-<suffix>`, unique within the namespace.
    pub id: String,

    /// The ordering partition this job belongs to.
    pub group_id: String,

    /// Producer-supplied value. `Null` if the stored payload was unreadable.
    pub payload: serde_json::Value,

    /// Failed attempts so far. Zero on first delivery.
    pub attempts: u32,

    /// Attempts allowed before the job is abandoned.
    pub max_attempts: u32,

    /// Producer sequence number, the secondary sort key.
    pub seq: u64,

    /// Primary sort key within the group.
    pub order_ms: i64,

    /// Enqueue time, epoch ms.
    pub enqueued_at: i64,

    /// When the current lease expires, epoch ms.
    pub deadline_at: i64,

    /// Lease token of this reservation. Only its holder may ack or fail it.
    #[serde(skip)]
    pub(crate) token: String,
}

impl Job {
    /// Build a job from a raw record, tolerating corrupted fields.
    ///
    /// Numeric fields that fail to parse fall back to defaults; a payload
    /// that is not valid JSON becomes `Null` so the job is still delivered.
    pub(crate) fn from_raw(raw: RawJob, token: String, default_max_attempts: u32) -> Self {
        let RawJob {
            id,
            group_id,
            deadline_at,
            fields,
        } = raw;

        let payload = match fields.get("payload") {
            Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
                warn!(job_id = %id, error = %e, "unreadable job payload, delivering null");
                serde_json::Value::Null
            }),
            None => serde_json::Value::Null,
        };

        let seq = parse_field(&fields, "seq")
            .or_else(|| crate::store::keys::seq_of(&id))
            .unwrap_or(0);

        Self {
            attempts: parse_field(&fields, "attempts").unwrap_or(0),
            max_attempts: parse_field(&fields, "maxAttempts")
                .filter(|n| *n > 0)
                .unwrap_or(default_max_attempts),
            seq,
            order_ms: parse_field(&fields, "orderMs").unwrap_or(0),
            enqueued_at: parse_field(&fields, "enqueuedAt").unwrap_or(0),
            deadline_at,
            payload,
            id,
            group_id,
            token,
        }
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    fields.get(name).and_then(|v| v.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// NewJob
// ---------------------------------------------------------------------------

/// Input for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob<P> {
    pub group_id: String,
    pub payload: P,
    /// Defaults to the enqueue time.
    pub order_ms: Option<i64>,
    /// Defaults to the queue's `max_attempts`.
    pub max_attempts: Option<u32>,
}

impl<P: Serialize> NewJob<P> {
    pub fn new(group_id: impl Into<String>, payload: P) -> Self {
        Self {
            group_id: group_id.into(),
            payload,
            order_ms: None,
            max_attempts: None,
        }
    }

    pub fn order_ms(mut self, order_ms: i64) -> Self {
        self.order_ms = Some(order_ms);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Jobs holding a lease.
    pub active: u64,
    /// Jobs waiting in groups that are not delayed.
    pub waiting: u64,
    /// Jobs in groups held back by a retry backoff or ordering delay.
    pub delayed: u64,
    pub total: u64,
    /// Groups that currently hold at least one job.
    pub unique_groups: u64,
}

/// Job ids by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobsByState {
    pub active: Vec<String>,
    pub waiting: Vec<String>,
    pub delayed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: &[(&str, &str)]) -> RawJob {
        RawJob {
            id: "0000000000000001-abcd".to_string(),
            group_id: "g".to_string(),
            deadline_at: 42,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn well_formed_record_parses() {
        let job = Job::from_raw(
            raw(&[
                ("payload", r#"{"n":1}"#),
                ("attempts", "2"),
                ("maxAttempts", "5"),
                ("seq", "1"),
                ("orderMs", "100"),
                ("enqueuedAt", "99"),
            ]),
            "tok".to_string(),
            3,
        );
        assert_eq!(job.payload, serde_json::json!({"n": 1}));
        assert_eq!(job.attempts, 2);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.order_ms, 100);
        assert_eq!(job.deadline_at, 42);
    }

    #[test]
    fn corrupted_record_falls_back_to_defaults() {
        let job = Job::from_raw(
            raw(&[
                ("payload", "invalid-json{malformed"),
                ("attempts", "not-a-number"),
                ("maxAttempts", "3"),
                ("enqueuedAt", "invalid-timestamp"),
            ]),
            "tok".to_string(),
            3,
        );
        assert!(job.payload.is_null());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.enqueued_at, 0);
        assert_eq!(job.seq, 1, "seq recovered from the job id");
    }
}
