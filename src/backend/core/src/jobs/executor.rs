//! Bounded-concurrency job executor.
//!
//! Every named queue gets its own [`QueueWorker`]: an unbounded FIFO channel of
//! job ids drained by a single dispatcher task, and a [`Semaphore`] sized to
//! the queue's concurrency. The dispatcher takes the next id, waits for a free
//! permit, then activates the job, so jobs start strictly in submission order.
//! Each job then runs on its own task holding the permit.
//!
//! ```text
//! submit ─▶ [ id │ id │ id ] ─▶ dispatcher ──permit──▶ run_job ─▶ store + bus
//!             per-queue FIFO     (1 per queue)          (≤ N per queue)
//! ```
//!
//! Handler failures and panics are contained here and turned into state
//! transitions; nothing propagates back to the submitter.

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::job::{InvalidTransition, Job, JobId};
use super::notify::{panic_message, NotificationBus};
use super::registry::{HandlerError, HandlerRegistry, ProgressReporter};
use super::retry::{BackoffStrategy, RetryPolicy};
use super::store::JobStore;
use crate::config::QueuesConfig;
use crate::error::{ErrorCode, JoblineError, Result};
use crate::telemetry::{FailureReason, JobMetrics};

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Maximum concurrently active jobs
    pub concurrency: usize,
    /// Worker slots currently held
    pub busy_slots: usize,
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Dispatch state of a single named queue.
pub struct QueueWorker {
    name: String,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<JobId>,
}

impl QueueWorker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of slots currently running a job.
    pub fn busy_slots(&self) -> usize {
        self.concurrency
            .saturating_sub(self.semaphore.available_permits())
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("busy_slots", &self.busy_slots())
            .finish()
    }
}

struct ExecutorInner {
    store: Arc<JobStore>,
    bus: NotificationBus,
    registry: Arc<HandlerRegistry>,
    queues: QueuesConfig,
    backoff: BackoffStrategy,
    workers: DashMap<String, Arc<QueueWorker>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Runs submitted jobs on per-queue worker pools.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("queues", &self.inner.workers.len())
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        bus: NotificationBus,
        registry: Arc<HandlerRegistry>,
        queues: QueuesConfig,
        backoff: BackoffStrategy,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                bus,
                registry,
                queues,
                backoff,
                workers: DashMap::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Fail fast if jobs can no longer be accepted.
    pub fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JoblineError::new(
                ErrorCode::QueueShutdown,
                "Queue is shutting down",
            ));
        }
        Handle::try_current().map_err(|e| {
            JoblineError::internal("job submission requires a running Tokio runtime")
                .with_source(e)
        })?;
        Ok(())
    }

    /// Append a waiting job to its queue's FIFO.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        self.ensure_accepting()?;
        let worker = self.worker(&job.queue_name)?;

        worker.sender.send(job.id).map_err(|_| {
            JoblineError::new(ErrorCode::QueueShutdown, "Queue is shutting down")
        })?;

        tracing::debug!(
            job_id = %job.id,
            queue = %job.queue_name,
            "Job enqueued"
        );
        Ok(())
    }

    /// Counts and slot usage for a queue.
    pub fn stats(&self, queue_name: &str) -> QueueStats {
        let counts = self.inner.store.counts(queue_name);
        let (concurrency, busy_slots) = match self.inner.workers.get(queue_name) {
            Some(worker) => (worker.concurrency, worker.busy_slots()),
            None => (self.inner.queues.concurrency_for(queue_name), 0),
        };

        QueueStats {
            queue_name: queue_name.to_string(),
            concurrency,
            busy_slots,
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
        }
    }

    /// Names of queues that have received at least one job.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop dispatching. Jobs not yet dispatched stay `waiting`.
    pub fn cancel(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Executor shutting down");
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
    }

    /// Stop dispatching and wait for running attempts to finish.
    pub async fn shutdown(&self) {
        self.cancel();
        self.inner.tracker.wait().await;
        tracing::info!("Executor stopped");
    }

    fn worker(&self, queue_name: &str) -> Result<Arc<QueueWorker>> {
        if let Some(worker) = self.inner.workers.get(queue_name) {
            return Ok(Arc::clone(worker.value()));
        }

        let handle = Handle::try_current().map_err(|e| {
            JoblineError::internal("job submission requires a running Tokio runtime")
                .with_source(e)
        })?;

        let entry = self
            .inner
            .workers
            .entry(queue_name.to_string())
            .or_insert_with(|| {
                let concurrency = self.inner.queues.concurrency_for(queue_name).max(1);
                let (sender, receiver) = mpsc::unbounded_channel();
                let worker = Arc::new(QueueWorker {
                    name: queue_name.to_string(),
                    concurrency,
                    semaphore: Arc::new(Semaphore::new(concurrency)),
                    sender,
                });

                self.inner.tracker.spawn_on(
                    dispatch_loop(Arc::clone(&self.inner), Arc::clone(&worker), receiver),
                    &handle,
                );

                tracing::info!(
                    queue = %queue_name,
                    concurrency,
                    "Queue worker started"
                );
                worker
            });

        Ok(Arc::clone(entry.value()))
    }
}

/// Pull ids in FIFO order, one free slot at a time.
async fn dispatch_loop(
    inner: Arc<ExecutorInner>,
    worker: Arc<QueueWorker>,
    mut receiver: mpsc::UnboundedReceiver<JobId>,
) {
    loop {
        let job_id = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            permit = Arc::clone(&worker.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // Activate here rather than in the spawned task so jobs start in
        // submission order.
        let Some(job) = inner.apply(&job_id, Job::mark_active) else {
            continue;
        };
        JobMetrics::record_started(&worker.name);

        let span = tracing::info_span!(
            "job.run",
            job_id = %job.id,
            queue = %job.queue_name,
            task_type = %job.task_type,
        );
        let runner = Arc::clone(&inner);
        inner.tracker.spawn(
            async move {
                let _permit = permit;
                runner.run_job(job).await;
            }
            .instrument(span),
        );
    }

    tracing::debug!(queue = %worker.name, "Queue dispatcher stopped");
}

impl ExecutorInner {
    /// Apply a transition and publish the resulting snapshot.
    fn apply<F>(&self, id: &JobId, transition: F) -> Option<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), InvalidTransition>,
    {
        match self.store.modify(id, transition) {
            Some((Ok(()), snapshot)) => {
                self.bus.publish(id, &snapshot);
                Some(snapshot)
            }
            Some((Err(rejected), _)) => {
                tracing::warn!(job_id = %id, error = %rejected, "Skipping job transition");
                None
            }
            None => {
                tracing::warn!(job_id = %id, "Job disappeared from store");
                None
            }
        }
    }

    fn progress_reporter(&self, id: JobId) -> ProgressReporter {
        let store = Arc::clone(&self.store);
        let bus = self.bus.clone();
        ProgressReporter::new(move |percent| {
            if let Some((true, snapshot)) = store.modify(&id, |job| job.set_progress(percent)) {
                bus.publish(&id, &snapshot);
            }
        })
    }

    /// Drive one active job to a terminal state.
    async fn run_job(&self, job: Job) {
        let started = Instant::now();
        let queue = job.queue_name.as_str();

        let Some(handler) = self.registry.resolve(queue, &job.task_type) else {
            let error = JoblineError::handler_missing(queue, &job.task_type);
            self.apply(&job.id, |j| {
                j.begin_attempt();
                j.mark_failed(error.user_message())
            });
            JobMetrics::record_failed(queue, FailureReason::HandlerMissing, started.elapsed());
            tracing::warn!(
                error_code = %error.code(),
                error = %error.user_message(),
                "Job failed without running"
            );
            return;
        };

        let policy = RetryPolicy::new(job.max_attempts, self.backoff.clone());
        let progress = self.progress_reporter(job.id);

        loop {
            let Some((attempt, _)) = self.store.modify(&job.id, Job::begin_attempt) else {
                tracing::warn!(job_id = %job.id, "Job disappeared from store");
                return;
            };

            tracing::debug!(attempt, handler = %handler.name(), "Invoking handler");

            let outcome = AssertUnwindSafe(handler.handle(&job.payload, &progress))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(result)) => {
                    self.apply(&job.id, |j| j.mark_completed(result));
                    JobMetrics::record_completed(queue, started.elapsed());
                    tracing::info!(
                        attempt,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                    return;
                }
                Ok(Err(error)) => error,
                Err(panic) => HandlerError::retryable(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if error.retryable && policy.should_retry(attempt) {
                let delay = policy.delay_before_retry(attempt);
                JobMetrics::record_retry(queue, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job attempt failed, retrying"
                );
                sleep_backoff(delay).await;
                continue;
            }

            let reason = if error.retryable {
                FailureReason::RetriesExhausted
            } else {
                FailureReason::Fatal
            };
            self.apply(&job.id, |j| j.mark_failed(error.message.clone()));
            JobMetrics::record_failed(queue, reason, started.elapsed());
            tracing::error!(
                attempt,
                reason = reason.as_str(),
                error = %error,
                "Job failed"
            );
            return;
        }
    }
}

async fn sleep_backoff(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
