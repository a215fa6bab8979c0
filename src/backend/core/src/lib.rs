#![allow(clippy::result_large_err)]
//! # Jobline Core
//!
//! In-process asynchronous job queue with bounded per-queue concurrency.
//!
//! ## Architecture
//!
//! - **Jobs**: job store, notification bus, handler registry, executor and the
//!   [`JobQueue`](jobs::JobQueue) facade
//! - **Retry**: composable retry policies for whole jobs and for individual records
//! - **Config**: layered configuration from files and `JOBLINE__*` environment variables
//! - **Telemetry**: structured logging and job lifecycle metrics
//! - **Error**: coded errors with user-facing and internal messages

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use config::Config;
pub use error::{ErrorCode, ErrorContext, ErrorSeverity, JoblineError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueuesConfig, UserApiConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, JoblineError, Result};
    pub use crate::jobs::{
        handler_fn, setup_user_processing, BackoffStrategy, BatchSummary, HandlerError,
        HandlerResult, HttpUserExecutor, Job, JobId, JobQueue, JobQueueBuilder, JobState, JobStatusView,
        ProcessRecordsHandler, ProgressReporter, QueueStats, RecordError, RecordExecutor,
        RetryPolicy, SubmitOptions, Subscription, TaskHandler, PROCESS_USERS_TASK,
        USER_PROCESSING_QUEUE,
    };
    pub use crate::telemetry::{init_telemetry, TelemetryConfig};
}
