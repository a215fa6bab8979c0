//! In-process asynchronous job queue.
//!
//! - **Job**: record with lifecycle `waiting → active → {completed | failed}`
//! - **Store**: authoritative, concurrently updated map of jobs
//! - **Notify**: per-job publish/subscribe of state snapshots
//! - **Registry**: handlers keyed by `(queue name, task type)`
//! - **Executor**: bounded per-queue worker pools with retry and backoff
//! - **Queue**: the facade tying them together
//! - **User API**: HTTP record executor for the built-in import handler
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                JobQueue                                  │
//! │  submit ───▶ ┌──────────┐   ┌──────────────────┐   ┌──────────────────┐  │
//! │              │ JobStore │◀──│     Executor     │──▶│ HandlerRegistry  │  │
//! │  get_status ▶│ (DashMap)│   │ per-queue FIFO + │   │ (queue, task) ─▶ │  │
//! │              └──────────┘   │ Semaphore(N)     │   │   TaskHandler    │  │
//! │                             └────────┬─────────┘   └──────────────────┘  │
//! │  subscribe ─▶ NotificationBus ◀──────┘ snapshots                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobline_core::jobs::{JobQueue, HandlerError};
//! use serde_json::json;
//!
//! let queue = JobQueue::builder().default_concurrency(2).build()?;
//!
//! queue.register_fn("emails", "send", |payload, progress| async move {
//!     progress.report(50);
//!     send(&payload).await.map_err(|e| HandlerError::retryable(e.to_string()))?;
//!     Ok(json!({ "sent": true }))
//! });
//!
//! let id = queue.submit("emails", "send", json!({ "to": "a@example.com" }))?.id;
//! let _sub = queue.subscribe(id, |job| println!("{} -> {}", job.id, job.state));
//! let status = queue.wait_for_terminal(&id, Duration::from_secs(30)).await?;
//! ```

pub mod builtin;
pub mod executor;
pub mod job;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod store;
pub mod user_api;

pub use builtin::{
    setup_user_processing, BatchSummary, ProcessRecordsHandler, RecordError, RecordExecutor,
    RecordFailure, MAX_REPORTED_ERRORS, PROCESS_USERS_TASK, USER_PROCESSING_QUEUE,
};
pub use executor::{Executor, QueueStats, QueueWorker};
pub use job::{InvalidTransition, Job, JobId, JobState, JobStatusView};
pub use notify::{NotificationBus, Subscription};
pub use queue::{JobQueue, JobQueueBuilder, SubmitOptions};
pub use registry::{
    handler_fn, FnHandler, HandlerError, HandlerKey, HandlerRegistry, HandlerResult,
    ProgressReporter, TaskHandler,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{JobStore, StateCounts};
pub use user_api::{HttpUserExecutor, NO_RESPONSE};
