//! Worker: the consumption loop.
//!
//! A worker reserves one job at a time, hands it to its [`Handler`], and
//! settles the outcome: completion on success, retry or abandonment on
//! failure. Any number of workers, in one process or many, may share a
//! namespace; the store guarantees they never hold the same group at once.
//!
//! ```text
//! Idle -> Reserving -> (nothing) -> Idle
//!         Reserving -> Executing -> Completing | Failing -> Idle
//! ```

pub mod event;
pub mod handler;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

pub use event::WorkerEvent;
pub use handler::{ErrorHook, FnHandler, Handler, JobContext};

use crate::backoff::{self, Backoff};
use crate::error::{Error, Result};
use crate::model::Job;
use crate::queue::{DEFAULT_MAX_ATTEMPTS, Queue};
use crate::reclaimer::{DEFAULT_CLEANUP_INTERVAL, Reclaimer};
use crate::store::{RetryOutcome, Waiter, duration_ms};
use crate::telemetry::job::{record_outcome, start_job_span};
use crate::telemetry::metrics;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Lease duration for jobs this worker reserves. `None` keeps the
    /// queue's setting.
    pub visibility_timeout_ms: Option<i64>,
    /// Soft ceiling on handler run time. When it elapses the job's
    /// cancellation token fires; the handler is never aborted.
    pub job_timeout: Duration,
    /// Wait on the store's wake-up signal between reservations instead of
    /// sleeping for `poll_interval`.
    pub use_blocking: bool,
    pub blocking_timeout: Duration,
    pub poll_interval: Duration,
    /// Upper bound on attempts, applied on top of each job's own limit.
    pub max_attempts: u32,
    /// Run the lease reclaimer alongside this worker.
    pub enable_cleanup: bool,
    pub cleanup_interval: Duration,
    /// Extend the lease at this interval while a handler runs.
    pub heartbeat_interval: Option<Duration>,
    /// Name used in logs and status reports.
    pub name: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: None,
            job_timeout: Duration::from_secs(30),
            use_blocking: true,
            blocking_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enable_cleanup: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            heartbeat_interval: None,
            name: None,
        }
    }
}

/// The job a worker is executing right now.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    pub job: Job,
    pub processing_time: Duration,
}

#[derive(Debug, Clone)]
struct Active {
    job: Job,
    started: Instant,
}

pub struct WorkerBuilder {
    queue: Queue,
    handler: Option<Arc<dyn Handler>>,
    on_error: Option<ErrorHook>,
    backoff: Backoff,
    options: WorkerOptions,
}

impl WorkerBuilder {
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use an async closure as the handler.
    pub fn handler_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(FnHandler(f))
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&anyhow::Error, Option<&Job>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Delay before re-delivering a failed job, by attempts so far.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// # Errors
    ///
    /// [`Error::Config`] if no handler was set.
    pub fn build(self) -> Result<Worker> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("worker requires a handler".to_string()))?;

        let queue = match self.options.visibility_timeout_ms {
            Some(ms) => self.queue.with_visibility_timeout_ms(ms),
            None => self.queue,
        };
        let name = self
            .options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-worker", queue.namespace()));
        let (events, _) = broadcast::channel(event::EVENT_CAPACITY);
        let (current, _) = watch::channel(None);

        Ok(Worker {
            inner: Arc::new(Inner {
                name,
                queue,
                handler,
                on_error: self.on_error,
                backoff: self.backoff,
                options: self.options,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                current,
                events,
                loop_task: Mutex::new(None),
                cleanup_task: Mutex::new(None),
            }),
        })
    }
}

/// Handle to a worker. Clones share the same loop.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    queue: Queue,
    handler: Arc<dyn Handler>,
    on_error: Option<ErrorHook>,
    backoff: Backoff,
    options: WorkerOptions,
    shutdown: CancellationToken,
    started: AtomicBool,
    current: watch::Sender<Option<Active>>,
    events: broadcast::Sender<WorkerEvent>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Worker {
    pub fn builder(queue: Queue) -> WorkerBuilder {
        WorkerBuilder {
            queue,
            handler: None,
            on_error: None,
            backoff: Arc::new(backoff::default_backoff),
            options: WorkerOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Start the loop (and the reclaimer, if enabled) on the current tokio
    /// runtime. Returns immediately.
    ///
    /// # Errors
    ///
    /// If the worker is already running or has been stopped.
    pub fn run(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Other(format!("worker {} has been stopped", inner.name)));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other(format!("worker {} is already running", inner.name)));
        }

        if inner.options.enable_cleanup {
            let reclaimer = Reclaimer::new(inner.queue.clone(), inner.options.cleanup_interval);
            let sweeper = Arc::clone(inner);
            let task = tokio::spawn(
                reclaimer.run_until(inner.shutdown.clone(), move |result| sweeper.after_sweep(result)),
            );
            *lock(&inner.cleanup_task) = Some(task);
        }

        let task = tokio::spawn(Arc::clone(inner).run_loop());
        *lock(&inner.loop_task) = Some(task);
        Ok(())
    }

    /// Stop reserving and wait for the in-flight handler to finish.
    pub async fn close(&self) {
        self.shutdown(None).await;
    }

    /// Like [`close`](Self::close), but give up waiting after `timeout`.
    /// The handler keeps running; its outcome is still recorded.
    pub async fn stop(&self, timeout: Duration) {
        self.shutdown(Some(timeout)).await;
    }

    async fn shutdown(&self, timeout: Option<Duration>) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let cleanup = lock(&inner.cleanup_task).take();
        if let Some(task) = cleanup {
            if let Err(e) = task.await {
                warn!(worker = %inner.name, error = %e, "cleanup task ended abnormally");
            }
        }

        let main = lock(&inner.loop_task).take();
        let Some(mut task) = main else {
            return;
        };
        match timeout {
            None => {
                if let Err(e) = task.await {
                    warn!(worker = %inner.name, error = %e, "worker loop ended abnormally");
                }
            }
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(worker = %inner.name, error = %e, "worker loop ended abnormally");
                }
                Err(_) => {
                    let job_id = self.current_job().map(|current| current.job.id);
                    warn!(
                        worker = %inner.name,
                        job_id = ?job_id,
                        timeout_ms = limit.as_millis() as u64,
                        "stop timed out with a job still processing"
                    );
                }
            }
        }
    }

    pub fn current_job(&self) -> Option<CurrentJob> {
        self.inner.current.borrow().as_ref().map(|active| CurrentJob {
            job: active.job.clone(),
            processing_time: active.started.elapsed(),
        })
    }

    pub fn is_processing(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report(&self, err: &anyhow::Error, job: Option<&Job>) {
        if let Some(hook) = &self.on_error {
            hook(err, job);
        }
    }

    fn report_store_error(&self, err: Error, job: Option<&Job>) {
        error!(worker = %self.name, job_id = ?job.map(|j| &j.id), error = %err, "queue operation failed");
        self.emit(WorkerEvent::Error {
            message: err.to_string(),
        });
        self.report(&anyhow::Error::from(err), job);
    }

    fn after_sweep(&self, result: Result<u64>) {
        match result {
            Ok(0) => {}
            Ok(count) => self.emit(WorkerEvent::Reclaimed { count }),
            Err(err) => self.report_store_error(err, None),
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(
            worker = %self.name,
            namespace = self.queue.namespace(),
            blocking = self.options.use_blocking,
            "worker started"
        );
        self.emit(WorkerEvent::Ready);

        let mut waiter: Option<Box<dyn Waiter>> = None;
        while !self.shutdown.is_cancelled() {
            let reserved = if self.options.use_blocking {
                self.reserve_blocking(&mut waiter).await
            } else {
                self.queue.reserve().await
            };

            match reserved {
                Ok(Some(job)) => self.process_one(job).await,
                Ok(None) => {
                    if !self.options.use_blocking {
                        self.pause(self.options.poll_interval).await;
                    }
                }
                Err(err) => {
                    // Reconnect the waiter on the next pass.
                    waiter = None;
                    self.report_store_error(err, None);
                    self.pause(self.options.poll_interval).await;
                }
            }
        }

        info!(worker = %self.name, "worker stopped");
        self.emit(WorkerEvent::Closed);
    }

    /// Reserve, or wait for a wake-up and try once more.
    ///
    /// Only the wait races against shutdown. Reservations always run to
    /// completion so a lease is never taken and then dropped on the floor.
    async fn reserve_blocking(&self, slot: &mut Option<Box<dyn Waiter>>) -> Result<Option<Job>> {
        if let Some(job) = self.queue.reserve().await? {
            return Ok(Some(job));
        }

        if slot.is_none() {
            *slot = Some(self.queue.waiter().await?);
        }
        let Some(waiter) = slot.as_mut() else {
            return Ok(None);
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            woke = self.queue.wait_for_work(waiter.as_mut(), self.options.blocking_timeout) => {
                woke?;
            }
        }
        self.queue.reserve().await
    }

    async fn process_one(&self, job: Job) {
        let span = start_job_span(
            self.queue.namespace(),
            &job.id,
            &job.group_id,
            job.attempts + 1,
        );
        self.execute(job, &span).instrument(span.clone()).await;
        self.current.send_replace(None);
    }

    async fn execute(&self, job: Job, span: &Span) {
        let started = Instant::now();
        self.current.send_replace(Some(Active {
            job: job.clone(),
            started,
        }));
        self.emit(WorkerEvent::Active {
            job_id: job.id.clone(),
            group_id: job.group_id.clone(),
        });
        debug!(worker = %self.name, "job started");

        let cancel = self.shutdown.child_token();
        let timer = {
            let cancel = cancel.clone();
            let limit = self.options.job_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                cancel.cancel();
            })
        };
        let heartbeat = self
            .options
            .heartbeat_interval
            .map(|every| self.spawn_heartbeat(job.clone(), every));

        let handler = Arc::clone(&self.handler);
        let ctx = JobContext::new(cancel);
        let delivered = job.clone();
        let outcome = match tokio::spawn(async move { handler.handle(delivered, ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(anyhow::anyhow!("handler panicked: {join}")),
        };

        timer.abort();
        if let Some(task) = heartbeat {
            task.abort();
        }

        let elapsed = started.elapsed();
        let labels = |outcome: &'static str| {
            [
                KeyValue::new("namespace", self.queue.namespace().to_string()),
                KeyValue::new("outcome", outcome),
            ]
        };

        match outcome {
            Ok(()) => {
                metrics::job_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &labels("completed"));
                self.settle_success(job, elapsed, span).await;
            }
            Err(err) => {
                metrics::job_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &labels("failed"));
                self.settle_failure(job, err, span).await;
            }
        }
    }

    async fn settle_success(&self, job: Job, elapsed: Duration, span: &Span) {
        match self.queue.complete(&job).await {
            Ok(true) => {
                record_outcome(span, "completed");
                debug!(duration_ms = elapsed.as_millis() as u64, "job completed");
                self.emit(WorkerEvent::Completed {
                    job_id: job.id,
                    group_id: job.group_id,
                    duration: elapsed,
                });
            }
            Ok(false) => record_outcome(span, "stale"),
            Err(err) => {
                record_outcome(span, "error");
                self.report_store_error(err, Some(&job));
            }
        }
    }

    async fn settle_failure(&self, job: Job, err: anyhow::Error, span: &Span) {
        let limit = job.max_attempts.min(self.options.max_attempts).max(1);
        let attempts = job.attempts + 1;
        let delay = if attempts >= limit {
            Duration::ZERO
        } else {
            (self.backoff)(attempts)
        };

        match self.queue.retry(&job, delay, limit).await {
            Ok(RetryOutcome::Retrying { attempts }) => {
                record_outcome(span, "retrying");
                warn!(
                    attempts,
                    max_attempts = limit,
                    backoff_ms = duration_ms(delay),
                    error = %err,
                    "job failed, will retry"
                );
                self.emit(WorkerEvent::Failed {
                    job_id: job.id,
                    group_id: job.group_id,
                    attempts,
                    will_retry: true,
                    error: err.to_string(),
                });
            }
            Ok(RetryOutcome::Abandoned { attempts }) => {
                record_outcome(span, "abandoned");
                error!(attempts, error = %err, "job abandoned after max attempts");
                self.emit(WorkerEvent::Failed {
                    job_id: job.id.clone(),
                    group_id: job.group_id.clone(),
                    attempts,
                    will_retry: false,
                    error: err.to_string(),
                });
                self.report(&err, Some(&job));
            }
            Ok(RetryOutcome::Stale) => record_outcome(span, "stale"),
            Err(store_err) => {
                record_outcome(span, "error");
                self.report_store_error(store_err, Some(&job));
            }
        }
    }

    fn spawn_heartbeat(&self, job: Job, every: Duration) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let extend = queue.visibility_timeout();
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                match queue.heartbeat(&job, extend).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job.id, "lease lost while the handler was running");
                        break;
                    }
                    Err(err) => warn!(job_id = %job.id, error = %err, "heartbeat failed"),
                }
            }
        })
    }
}
