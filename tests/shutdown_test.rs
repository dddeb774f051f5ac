//! Integration tests for the graceful shutdown helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use groupq::shutdown::{ShutdownOptions, graceful_shutdown, workers_status};
use groupq::{Job, NewJob, Queue, QueueOptions, Worker, WorkerOptions};
use serde_json::json;

fn slow_worker(queue: &Queue, name: &str, done: Arc<AtomicU32>) -> Worker {
    Worker::builder(queue.clone())
        .handler_fn(move |_job: Job, _ctx| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .options(WorkerOptions {
            name: Some(name.to_string()),
            poll_interval: Duration::from_millis(10),
            blocking_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn status_reports_busy_and_idle_workers() {
    let queue = Queue::in_memory("status", QueueOptions::default());
    queue.add(NewJob::new("only", json!(null))).await.unwrap();

    let done = Arc::new(AtomicU32::new(0));
    let workers = vec![
        slow_worker(&queue, "w0", Arc::clone(&done)),
        slow_worker(&queue, "w1", Arc::clone(&done)),
    ];
    for worker in &workers {
        worker.run().unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while workers_status(&workers).processing == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no worker picked up the job");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = workers_status(&workers);
    assert_eq!(status.total, 2);
    assert_eq!(status.processing, 1);
    assert_eq!(status.idle, 1);
    let busy = status.workers.iter().find(|w| w.job_id.is_some()).unwrap();
    assert_eq!(busy.group_id.as_deref(), Some("only"));
    assert!(busy.name == "w0" || busy.name == "w1");

    graceful_shutdown(&workers, &[queue.clone()], &ShutdownOptions::default()).await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(workers.iter().all(|w| w.is_stopped() && !w.is_processing()));
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_jobs() {
    let queue = Queue::in_memory("drain", QueueOptions::default());
    for group in ["a", "b", "c"] {
        queue.add(NewJob::new(group, json!(null))).await.unwrap();
    }

    let done = Arc::new(AtomicU32::new(0));
    let workers: Vec<Worker> = (0..3)
        .map(|i| slow_worker(&queue, &format!("w{i}"), Arc::clone(&done)))
        .collect();
    for worker in &workers {
        worker.run().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let options = ShutdownOptions {
        queue_empty_timeout: Duration::from_secs(5),
        worker_stop_timeout: Duration::from_secs(5),
    };
    graceful_shutdown(&workers, &[queue.clone()], &options).await;

    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(queue.counts().await.unwrap().active, 0);
}
