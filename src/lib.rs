//! # groupq
//!
//! Redis-backed grouped work queue.
//!
//! Jobs are partitioned into groups. Within a group they are processed
//! strictly in order, one at a time; across groups any number of workers
//! run in parallel. Reservation is lease-based: a worker that dies loses
//! its lease after the visibility timeout and the job is delivered again.
//!
//! ```no_run
//! use groupq::{NewJob, Queue, QueueOptions, Worker};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let queue = Queue::connect("redis://127.0.0.1/", "orders", QueueOptions::default()).await?;
//! queue.add(NewJob::new("customer-42", serde_json::json!({ "sku": "A1" }))).await?;
//!
//! let worker = Worker::builder(queue.clone())
//!     .handler_fn(|job, _ctx| async move {
//!         println!("{} {}", job.group_id, job.payload);
//!         Ok(())
//!     })
//!     .build()?;
//! worker.run()?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod reclaimer;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use model::{Job, JobsByState, NewJob, QueueCounts};
pub use queue::{Queue, QueueOptions};
pub use store::RetryOutcome;
pub use worker::{JobContext, Worker, WorkerEvent, WorkerOptions};
