//! Built-in batch record processing.
//!
//! [`ProcessRecordsHandler`] runs every record in `payload.records` through a
//! [`RecordExecutor`], retrying each record on its own policy. Records that
//! still fail are counted and summarized; they never fail the job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue::JobQueue;
use crate::error::ErrorCode;
use super::registry::{HandlerError, HandlerResult, ProgressReporter, TaskHandler};
use super::retry::RetryPolicy;

/// Queue the user import handler is registered on.
pub const USER_PROCESSING_QUEUE: &str = "user-processing";

/// Task type of user import jobs.
pub const PROCESS_USERS_TASK: &str = "process-users";

/// Failures kept in a [`BatchSummary`].
pub const MAX_REPORTED_ERRORS: usize = 10;

/// Failure of a single record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RecordError {
    pub message: String,
}

impl RecordError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Performs the work for one record, typically a call to an external service.
#[async_trait]
pub trait RecordExecutor: Send + Sync + 'static {
    async fn execute(&self, record: &Value) -> Result<Value, RecordError>;
}

/// A record that failed every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Record identity: its `email`, else its `name`, else the record itself
    pub user: String,
    pub error: String,
}

/// Result of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    /// First [`MAX_REPORTED_ERRORS`] failures
    pub errors: Vec<RecordFailure>,
}

/// Handler for `{ "records": [...] }` payloads.
pub struct ProcessRecordsHandler<E> {
    executor: E,
    record_retry: RetryPolicy,
}

impl<E: RecordExecutor> ProcessRecordsHandler<E> {
    pub fn new(executor: E, record_retry: RetryPolicy) -> Self {
        Self {
            executor,
            record_retry,
        }
    }

    /// Process records in order, reporting progress after each one.
    pub async fn process(&self, records: &[Value], progress: &ProgressReporter) -> BatchSummary {
        let total = records.len();
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            let outcome = self
                .record_retry
                .run(|attempt| {
                    if attempt > 1 {
                        tracing::debug!(record = index, attempt, "Retrying record");
                    }
                    self.executor.execute(record)
                })
                .await;

            match outcome {
                Ok(_) => summary.processed += 1,
                Err(error) => {
                    summary.failed += 1;
                    let user = record_identity(record);
                    tracing::warn!(
                        record = index,
                        user = %user,
                        error = %error,
                        "Record failed"
                    );
                    if summary.errors.len() < MAX_REPORTED_ERRORS {
                        summary.errors.push(RecordFailure {
                            user,
                            error: error.message,
                        });
                    }
                }
            }

            progress.report(((index + 1) * 100 / total) as u32);
        }

        summary
    }
}

#[async_trait]
impl<E: RecordExecutor> TaskHandler for ProcessRecordsHandler<E> {
    async fn handle(&self, payload: &Value, progress: &ProgressReporter) -> HandlerResult {
        let records = payload
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                HandlerError::fatal("payload has no records array")
                    .with_code(ErrorCode::InvalidPayload.to_string())
            })?;

        tracing::info!(records = records.len(), "Processing records");
        let summary = self.process(records, progress).await;
        tracing::info!(
            processed = summary.processed,
            failed = summary.failed,
            total = summary.total,
            "Processed records"
        );

        Ok(serde_json::to_value(summary)?)
    }

    fn name(&self) -> &str {
        "process_records"
    }
}

/// Register the user import handler on `queue`, using its configured
/// per-record retry policy.
pub fn setup_user_processing<E: RecordExecutor>(queue: &JobQueue, executor: E) {
    let handler = ProcessRecordsHandler::new(executor, queue.config().record_retry.clone());
    queue.register_task_handler(USER_PROCESSING_QUEUE, PROCESS_USERS_TASK, handler);
}

fn record_identity(record: &Value) -> String {
    ["email", "name"]
        .iter()
        .find_map(|field| record.get(field).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| record.to_string())
}
