//! Job lifecycle metrics over the `metrics` facade.
//!
//! The crate only records; installing an exporter (Prometheus or otherwise)
//! is left to the embedding process. Without a recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use jobline_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::describe();
//! JobMetrics::record_submitted("user-processing", "process-users");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Names of every metric recorded by the crate.
pub mod names {
    pub const JOBS_SUBMITTED: &str = "jobline_jobs_submitted_total";
    pub const JOBS_STARTED: &str = "jobline_jobs_started_total";
    pub const JOBS_COMPLETED: &str = "jobline_jobs_completed_total";
    pub const JOBS_FAILED: &str = "jobline_jobs_failed_total";
    pub const JOB_RETRIES: &str = "jobline_job_retries_total";
    pub const JOBS_ACTIVE: &str = "jobline_jobs_active";
    pub const JOB_DURATION: &str = "jobline_job_duration_seconds";
    pub const LISTENER_FAILURES: &str = "jobline_listener_failures_total";
}

/// Failure reasons used as the `reason` label on the failed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    HandlerMissing,
    RetriesExhausted,
    Fatal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerMissing => "handler_missing",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Fatal => "fatal",
        }
    }
}

/// Recorder for job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    /// Register descriptions with the installed recorder.
    pub fn describe() {
        describe_counter!(names::JOBS_SUBMITTED, "Jobs accepted by submit");
        describe_counter!(names::JOBS_STARTED, "Jobs that moved from waiting to active");
        describe_counter!(names::JOBS_COMPLETED, "Jobs that reached the completed state");
        describe_counter!(names::JOBS_FAILED, "Jobs that reached the failed state");
        describe_counter!(names::JOB_RETRIES, "Handler attempts retried after a failure");
        describe_gauge!(names::JOBS_ACTIVE, "Jobs currently active per queue");
        describe_histogram!(names::JOB_DURATION, "Time from start to terminal state");
        describe_counter!(names::LISTENER_FAILURES, "Notification listeners that panicked");
    }

    pub fn record_submitted(queue: &str, task_type: &str) {
        counter!(
            names::JOBS_SUBMITTED,
            "queue" => queue.to_string(),
            "task_type" => task_type.to_string(),
        )
        .increment(1);
    }

    pub fn record_started(queue: &str) {
        counter!(names::JOBS_STARTED, "queue" => queue.to_string()).increment(1);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).increment(1.0);
    }

    pub fn record_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED, "queue" => queue.to_string()).increment(1);
        Self::record_finished(queue, "completed", duration);
    }

    pub fn record_failed(queue: &str, reason: FailureReason, duration: Duration) {
        counter!(
            names::JOBS_FAILED,
            "queue" => queue.to_string(),
            "reason" => reason.as_str(),
        )
        .increment(1);
        Self::record_finished(queue, "failed", duration);
    }

    pub fn record_retry(queue: &str, attempt: u32) {
        counter!(
            names::JOB_RETRIES,
            "queue" => queue.to_string(),
            "attempt" => attempt.to_string(),
        )
        .increment(1);
    }

    pub fn record_listener_failure() {
        counter!(names::LISTENER_FAILURES).increment(1);
    }

    fn record_finished(queue: &str, outcome: &'static str, duration: Duration) {
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).decrement(1.0);
        histogram!(
            names::JOB_DURATION,
            "queue" => queue.to_string(),
            "outcome" => outcome,
        )
        .record(duration.as_secs_f64());
    }
}
