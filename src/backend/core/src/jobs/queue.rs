//! Queue facade.
//!
//! [`JobQueue`] composes the store, notification bus, handler registry and
//! executor into one explicitly constructed service. Independent instances
//! share nothing, so tests and embedders can run several side by side.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::executor::{Executor, QueueStats};
use super::job::{Job, JobId, JobStatusView};
use super::notify::{NotificationBus, Subscription};
use super::registry::{handler_fn, HandlerRegistry, HandlerResult, ProgressReporter, TaskHandler};
use super::retry::RetryPolicy;
use super::store::JobStore;
use crate::config::Config;
use crate::error::{ErrorCode, JoblineError, Result};
use crate::telemetry::JobMetrics;

/// Per-submission overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Attempts allowed for this job instead of the configured default
    pub max_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

struct QueueInner {
    config: Config,
    store: Arc<JobStore>,
    bus: NotificationBus,
    registry: Arc<HandlerRegistry>,
    executor: Executor,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Dispatcher tasks hold the executor, not the facade; stop them.
        self.executor.cancel();
    }
}

/// In-process asynchronous job queue.
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("jobs", &self.inner.store.len())
            .field("handlers", &self.inner.registry.len())
            .field("executor", &self.inner.executor)
            .finish()
    }
}

impl JobQueue {
    /// Create a queue from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        JobMetrics::describe();

        let store = Arc::new(JobStore::new());
        let bus = NotificationBus::new();
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Executor::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&registry),
            config.queues.clone(),
            config.retry.backoff.clone(),
        );

        tracing::info!(
            default_concurrency = config.queues.default_concurrency,
            max_attempts = config.retry.max_attempts,
            "Job queue created"
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                bus,
                registry,
                executor,
            }),
        })
    }

    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Submit a job. Returns the `waiting` snapshot as soon as the job is
    /// stored; execution happens in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        queue_name: &str,
        task_type: &str,
        payload: serde_json::Value,
    ) -> Result<Job> {
        self.submit_with(queue_name, task_type, payload, SubmitOptions::default())
    }

    /// Submit with per-job overrides.
    pub fn submit_with(
        &self,
        queue_name: &str,
        task_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Job> {
        if queue_name.trim().is_empty() || task_type.trim().is_empty() {
            return Err(JoblineError::new(
                ErrorCode::InvalidPayload,
                "Queue name and task type must not be empty",
            ));
        }
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.inner.config.retry.max_attempts);
        if max_attempts == 0 {
            return Err(JoblineError::new(
                ErrorCode::InvalidPayload,
                "max_attempts must be at least 1",
            ));
        }

        self.inner.executor.ensure_accepting()?;

        let job = self
            .inner
            .store
            .create(task_type, queue_name, payload, max_attempts);
        self.enqueue_created(&job)?;
        JobMetrics::record_submitted(queue_name, task_type);

        tracing::info!(
            job_id = %job.id,
            queue = %queue_name,
            task_type = %task_type,
            max_attempts,
            "Job submitted"
        );
        Ok(job)
    }

    /// Hand a freshly stored job to its queue. A refused job is removed again
    /// so a failed submit leaves nothing behind.
    fn enqueue_created(&self, job: &Job) -> Result<()> {
        self.inner.executor.enqueue(job).map_err(|error| {
            self.inner.store.remove(&job.id);
            error
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Current status of a job.
    pub fn get_status(&self, job_id: &JobId) -> Result<JobStatusView> {
        self.get_job(job_id).map(JobStatusView::from)
    }

    /// Full snapshot of a job, including its payload.
    pub fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.inner
            .store
            .get(job_id)
            .ok_or_else(|| JoblineError::job_not_found(job_id))
    }

    /// Status of every job on a queue, oldest first.
    pub fn list_jobs(&self, queue_name: &str) -> Vec<JobStatusView> {
        self.inner
            .store
            .list_queue(queue_name)
            .iter()
            .map(JobStatusView::from)
            .collect()
    }

    pub fn stats(&self, queue_name: &str) -> QueueStats {
        self.inner.executor.stats(queue_name)
    }

    /// Wait until the job is `completed` or `failed`.
    ///
    /// Subscribes before reading the current status, so a transition that
    /// races with the call is not missed.
    pub async fn wait_for_terminal(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<JobStatusView> {
        let (subscription, mut updates) = self.subscribe_channel(*job_id);

        let current = self.get_status(job_id)?;
        if current.state.is_terminal() {
            return Ok(current);
        }

        let result = tokio::time::timeout(timeout, async {
            while let Some(job) = updates.recv().await {
                if job.is_terminal() {
                    return Ok(JobStatusView::from(job));
                }
            }
            self.get_status(job_id)
        })
        .await;

        subscription.unsubscribe();
        result?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Receive a snapshot on every change to `job_id` until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    ///
    /// Changes made before subscribing are not replayed; call
    /// [`get_status`](Self::get_status) afterwards for the current state.
    pub fn subscribe<F>(&self, job_id: JobId, listener: F) -> Subscription
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(job_id, listener)
    }

    pub fn subscribe_channel(&self, job_id: JobId) -> (Subscription, mpsc::UnboundedReceiver<Job>) {
        self.inner.bus.subscribe_channel(job_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register the handler for `(queue_name, task_type)`, replacing any
    /// previous one.
    pub fn register_task_handler<H>(&self, queue_name: &str, task_type: &str, handler: H)
    where
        H: TaskHandler,
    {
        self.inner
            .registry
            .register(queue_name, task_type, Arc::new(handler));
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, queue_name: &str, task_type: &str, f: F)
    where
        F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_task_handler(queue_name, task_type, handler_fn(f));
    }

    pub fn has_handler(&self, queue_name: &str, task_type: &str) -> bool {
        self.inner.registry.contains(queue_name, task_type)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop dispatching and wait for running attempts to finish.
    ///
    /// Later submissions fail with [`ErrorCode::QueueShutdown`]; jobs that
    /// were still waiting stay `waiting`.
    pub async fn shutdown(&self) {
        self.inner.executor.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.executor.is_shutdown()
    }
}

/// Builder for [`JobQueue`].
#[derive(Debug, Clone, Default)]
pub struct JobQueueBuilder {
    config: Config,
}

impl JobQueueBuilder {
    /// Start from an existing configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Concurrency for queues without an override.
    pub fn default_concurrency(mut self, concurrency: usize) -> Self {
        self.config.queues.default_concurrency = concurrency;
        self
    }

    /// Concurrency for one named queue.
    pub fn queue_concurrency(mut self, queue_name: impl Into<String>, concurrency: usize) -> Self {
        self.config
            .queues
            .overrides
            .insert(queue_name.into(), concurrency);
        self
    }

    /// Retry policy for handler invocations.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Retry policy for individual records processed by batch handlers.
    pub fn record_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.record_retry = policy;
        self
    }

    pub fn build(self) -> Result<JobQueue> {
        JobQueue::new(self.config)
    }
}
