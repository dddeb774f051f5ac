//! Integration tests for the queue protocol, against the in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use groupq::store::memory::MemoryBackend;
use groupq::store::{Backend, MAX_SCORE_MS};
use groupq::{Error, NewJob, Queue, QueueOptions, RetryOutcome};
use serde_json::{Value, json};

fn test_queue() -> Queue {
    Queue::in_memory("test", QueueOptions::default())
}

fn order(job: &groupq::Job) -> i64 {
    job.payload["n"].as_i64().unwrap()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reserve_delivers_group_head_by_order_ms() {
    let queue = test_queue();
    for n in [3, 1, 2] {
        queue
            .add(NewJob::new("g1", json!({ "n": n })).order_ms(n))
            .await
            .unwrap();
    }

    let first = queue.reserve().await.unwrap().expect("a job");
    assert_eq!(order(&first), 1);
    assert_eq!(first.group_id, "g1");
    assert_eq!(first.attempts, 0);
    assert_eq!(first.max_attempts, 3);

    // The group is leased, nothing else is reservable.
    assert!(queue.reserve().await.unwrap().is_none());

    assert!(queue.complete(&first).await.unwrap());
    let second = queue.reserve().await.unwrap().expect("a job");
    assert_eq!(order(&second), 2);
}

#[tokio::test]
async fn equal_order_ms_falls_back_to_enqueue_sequence() {
    let queue = test_queue();
    let a = queue
        .add(NewJob::new("g", json!({ "n": 0 })).order_ms(500))
        .await
        .unwrap();
    let b = queue
        .add(NewJob::new("g", json!({ "n": 1 })).order_ms(500))
        .await
        .unwrap();
    assert!(a < b, "job ids sort by sequence: {a} vs {b}");

    let job = queue.reserve().await.unwrap().unwrap();
    assert_eq!(job.id, a);
    assert!(job.seq < groupq::store::keys::seq_of(&b).unwrap());
}

#[tokio::test]
async fn late_job_with_earlier_order_jumps_ahead() {
    let queue = test_queue();
    queue
        .add(NewJob::new("g", json!({ "n": 20 })).order_ms(20))
        .await
        .unwrap();
    queue
        .add(NewJob::new("g", json!({ "n": 10 })).order_ms(10))
        .await
        .unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    assert_eq!(order(&job), 10);
}

#[tokio::test]
async fn groups_are_reserved_independently() {
    let queue = test_queue();
    queue.add(NewJob::new("a", json!({ "n": 1 }))).await.unwrap();
    queue.add(NewJob::new("b", json!({ "n": 2 }))).await.unwrap();
    queue.add(NewJob::new("a", json!({ "n": 3 }))).await.unwrap();

    let first = queue.reserve().await.unwrap().unwrap();
    let second = queue.reserve().await.unwrap().unwrap();
    assert_ne!(first.group_id, second.group_id);
    assert!(queue.reserve().await.unwrap().is_none());
}

#[tokio::test]
async fn ordering_delay_holds_fresh_jobs_back() {
    let queue = Queue::in_memory(
        "delay",
        QueueOptions {
            ordering_delay_ms: 100,
            ..Default::default()
        },
    );
    queue.add(NewJob::new("g", json!(null))).await.unwrap();

    assert!(queue.reserve().await.unwrap().is_none());
    assert_eq!(queue.counts().await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(queue.reserve().await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Retry & abandonment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_keeps_job_at_group_head() {
    let queue = test_queue();
    queue.add(NewJob::new("g", json!({ "n": 1 }))).await.unwrap();
    queue.add(NewJob::new("g", json!({ "n": 2 }))).await.unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    let outcome = queue.retry(&job, Duration::ZERO, 3).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Retrying { attempts: 1 });

    let again = queue.reserve().await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 1);
}

#[tokio::test]
async fn retry_backoff_delays_the_whole_group() {
    let queue = test_queue();
    queue.add(NewJob::new("g", json!({ "n": 1 }))).await.unwrap();
    queue.add(NewJob::new("g", json!({ "n": 2 }))).await.unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    queue
        .retry(&job, Duration::from_secs(60), 3)
        .await
        .unwrap();

    assert!(queue.reserve().await.unwrap().is_none());
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 2);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
async fn retry_at_limit_abandons_and_advances_group() {
    let queue = test_queue();
    queue.add(NewJob::new("g", json!({ "n": 1 }))).await.unwrap();
    queue.add(NewJob::new("g", json!({ "n": 2 }))).await.unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    let outcome = queue.retry(&job, Duration::ZERO, 1).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Abandoned { attempts: 1 });

    let next = queue.reserve().await.unwrap().unwrap();
    assert_eq!(order(&next), 2);
    assert_eq!(queue.counts().await.unwrap().total, 1);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_is_reclaimed_without_counting_an_attempt() {
    let queue = Queue::in_memory(
        "leases",
        QueueOptions {
            visibility_timeout_ms: 0,
            ..Default::default()
        },
    );
    queue.add(NewJob::new("g", json!({ "n": 1 }))).await.unwrap();

    let crashed = queue.reserve().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(queue.reclaim().await.unwrap(), 1);

    let redelivered = queue.reserve().await.unwrap().unwrap();
    assert_eq!(redelivered.id, crashed.id);
    assert_eq!(redelivered.attempts, 0);

    // The crashed holder's token is no longer valid.
    assert!(!queue.complete(&crashed).await.unwrap());
    assert_eq!(
        queue.retry(&crashed, Duration::ZERO, 3).await.unwrap(),
        RetryOutcome::Stale
    );
    assert!(queue.complete(&redelivered).await.unwrap());
    assert_eq!(queue.counts().await.unwrap().total, 0);
}

#[tokio::test]
async fn heartbeat_extends_the_lease() {
    let queue = Queue::in_memory(
        "heartbeat",
        QueueOptions {
            visibility_timeout_ms: 0,
            ..Default::default()
        },
    );
    queue.add(NewJob::new("g", json!(null))).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();

    assert!(queue.heartbeat(&job, Duration::from_secs(60)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(queue.reclaim().await.unwrap(), 0);
    assert_eq!(queue.counts().await.unwrap().active, 1);
}

#[tokio::test]
async fn negative_visibility_timeout_uses_default_lease() {
    let queue = Queue::in_memory(
        "vt",
        QueueOptions {
            visibility_timeout_ms: -5,
            ..Default::default()
        },
    );
    assert_eq!(queue.visibility_timeout(), Duration::from_millis(30_000));

    queue.add(NewJob::new("g", json!(null))).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();
    let lease_ms = job.deadline_at - chrono::Utc::now().timestamp_millis();
    assert!(lease_ms > 25_000, "lease of {lease_ms} ms");
}

#[tokio::test]
async fn huge_visibility_timeout_saturates_the_lease() {
    let queue = Queue::in_memory(
        "vt-max",
        QueueOptions {
            visibility_timeout_ms: i64::MAX,
            ..Default::default()
        },
    );
    queue.add(NewJob::new("g", json!(null))).await.unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    assert_eq!(job.deadline_at, MAX_SCORE_MS);
    assert_eq!(queue.reclaim().await.unwrap(), 0);

    assert!(queue.heartbeat(&job, Duration::MAX).await.unwrap());
    assert_eq!(queue.reclaim().await.unwrap(), 0);
    assert!(queue.complete(&job).await.unwrap());
}

#[tokio::test]
async fn huge_backoff_keeps_the_group_delayed() {
    let queue = test_queue();
    queue.add(NewJob::new("g", json!(null))).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();

    let outcome = queue
        .retry(&job, Duration::from_secs(u64::MAX / 1000), 3)
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Retrying { attempts: 1 });
    assert!(queue.reserve().await.unwrap().is_none());
    assert_eq!(
        queue.backend().next_delayed_at().await.unwrap(),
        Some(MAX_SCORE_MS)
    );
}

#[tokio::test]
async fn huge_ordering_delay_holds_the_job() {
    let queue = Queue::in_memory(
        "delay-max",
        QueueOptions {
            ordering_delay_ms: u64::MAX,
            ..Default::default()
        },
    );
    queue.add(NewJob::new("g", json!(null))).await.unwrap();

    assert!(queue.reserve().await.unwrap().is_none());
    assert_eq!(queue.counts().await.unwrap().delayed, 1);
}

// ---------------------------------------------------------------------------
// Producer errors & corrupted state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unserializable_payload_is_rejected_before_any_write() {
    let backend = MemoryBackend::new("reject");
    let queue = Queue::with_backend(Arc::new(backend.clone()), QueueOptions::default());

    // JSON object keys must be strings.
    let payload: HashMap<(i32, i32), i32> = HashMap::from([((1, 2), 3)]);
    let err = queue.add(NewJob::new("g", payload)).await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)), "got {err:?}");

    assert_eq!(backend.record_count().await, 0);
    assert_eq!(queue.counts().await.unwrap().total, 0);
    assert!(queue.unique_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn none_payload_is_stored_as_null() {
    let queue = test_queue();
    queue.add(NewJob::new("g", None::<String>)).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();
    assert!(job.payload.is_null());
}

#[tokio::test]
async fn corrupted_record_is_delivered_with_defaults() {
    let backend = MemoryBackend::new("corrupt");
    backend
        .insert_raw(
            "g",
            "0000000000000007-deadbeef",
            0,
            HashMap::from([
                ("payload".to_string(), "invalid-json{malformed".to_string()),
                ("attempts".to_string(), "not-a-number".to_string()),
                ("maxAttempts".to_string(), "3".to_string()),
                ("enqueuedAt".to_string(), "invalid-timestamp".to_string()),
                ("groupId".to_string(), "g".to_string()),
            ]),
        )
        .await;
    let queue = Queue::with_backend(Arc::new(backend.clone()), QueueOptions::default());

    let job = queue.reserve().await.unwrap().expect("corrupted job is still delivered");
    assert!(job.payload.is_null());
    assert_eq!(job.attempts, 0);
    assert_eq!(job.enqueued_at, 0);
    assert_eq!(job.seq, 7);

    assert!(queue.complete(&job).await.unwrap());
    assert_eq!(backend.record_count().await, 0);
}

#[tokio::test]
async fn typed_payload_round_trips() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Event {
        session: String,
        step: u32,
    }

    let queue = test_queue();
    let event = Event {
        session: "s-1".to_string(),
        step: 4,
    };
    queue.add(NewJob::new("s-1", &event)).await.unwrap();

    let job = queue.reserve().await.unwrap().unwrap();
    assert_eq!(job.payload_as::<Event>().unwrap(), event);
}

#[tokio::test]
async fn payloads_round_trip_unchanged() {
    let queue = test_queue();
    let payloads = vec![
        json!({ "text": "héllo wörld 🚀 日本語", "nested": { "list": [1, 2.5, "ü"] } }),
        Value::String("x".repeat(1 << 20)),
        json!({}),
        json!([]),
        json!(""),
        json!(0),
        json!(false),
        Value::Null,
    ];
    for (i, payload) in payloads.iter().enumerate() {
        queue.add(NewJob::new(format!("g{i}"), payload)).await.unwrap();
    }

    let mut delivered = HashMap::new();
    while let Some(job) = queue.reserve().await.unwrap() {
        assert!(queue.complete(&job).await.unwrap());
        delivered.insert(job.group_id.clone(), job.payload);
    }

    assert_eq!(delivered.len(), payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(&delivered[&format!("g{i}")], payload, "payload {i}");
    }
}

// ---------------------------------------------------------------------------
// Inspection & blocking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counts_and_jobs_reflect_state() {
    let queue = test_queue();
    let a1 = queue.add(NewJob::new("a", json!(1))).await.unwrap();
    let a2 = queue.add(NewJob::new("a", json!(2))).await.unwrap();
    let b1 = queue.add(NewJob::new("b", json!(3))).await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.waiting, 3);
    assert_eq!(counts.unique_groups, 2);

    let leased = queue.reserve().await.unwrap().unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(counts.waiting, 2);

    let jobs = queue.jobs().await.unwrap();
    assert_eq!(jobs.active, vec![leased.id.clone()]);
    let mut all: Vec<String> = jobs.active.iter().chain(&jobs.waiting).cloned().collect();
    all.sort();
    let mut expected = vec![a1, a2, b1];
    expected.sort();
    assert_eq!(all, expected);

    assert_eq!(queue.unique_groups().await.unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn wait_for_empty_tracks_active_jobs() {
    let queue = test_queue();
    queue.add(NewJob::new("g", json!(null))).await.unwrap();
    let job = queue.reserve().await.unwrap().unwrap();

    assert!(!queue.wait_for_empty(Duration::from_millis(50)).await.unwrap());
    queue.complete(&job).await.unwrap();
    assert!(queue.wait_for_empty(Duration::from_millis(50)).await.unwrap());
}

#[tokio::test]
async fn reserve_blocking_wakes_on_enqueue() {
    let queue = test_queue();
    let consumer = queue.clone();
    let waiting = tokio::spawn(async move {
        let mut waiter = consumer.waiter().await.unwrap();
        consumer
            .reserve_blocking(waiter.as_mut(), Duration::from_secs(5))
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = std::time::Instant::now();
    queue.add(NewJob::new("g", json!({ "n": 1 }))).await.unwrap();

    let job = waiting.await.unwrap().expect("woken by the enqueue");
    assert_eq!(order(&job), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn reserve_blocking_times_out_empty() {
    let queue = test_queue();
    let mut waiter = queue.waiter().await.unwrap();
    let job = queue
        .reserve_blocking(waiter.as_mut(), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(job.is_none());
}
