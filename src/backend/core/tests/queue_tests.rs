//! End-to-end tests for the job queue.
//!
//! Tests cover:
//! - Initial state after submission
//! - Completion, failure and retry semantics
//! - Per-queue concurrency bounds and FIFO start order
//! - Missing handlers and unknown job ids
//! - The built-in user import handler
//! - Graceful shutdown

use async_trait::async_trait;
use jobline_core::error::{ErrorCode, JoblineError};
use jobline_core::jobs::{
    setup_user_processing, BackoffStrategy, BatchSummary, HandlerError, JobId, JobQueue,
    JobState, RecordError, RecordExecutor, RetryPolicy, PROCESS_USERS_TASK,
    USER_PROCESSING_QUEUE,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn fast_queue() -> JobQueue {
    JobQueue::builder()
        .retry_policy(RetryPolicy::new(3, BackoffStrategy::none()))
        .record_retry_policy(RetryPolicy::new(3, BackoffStrategy::none()))
        .build()
        .unwrap()
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_status_immediately_after_submit_is_waiting() {
    let queue = fast_queue();
    queue.register_fn("q", "t", |_, _| async { Ok(json!("done")) });

    let submitted = queue.submit("q", "t", json!({ "n": 1 })).unwrap();
    assert_eq!(submitted.state, JobState::Waiting);
    assert_eq!(submitted.payload, json!({ "n": 1 }));

    let status = queue.get_status(&submitted.id).unwrap();

    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.progress, 0);
    assert!(status.result.is_none());
    assert!(status.error.is_none());
    assert!(!status.is_completed);
    assert!(!status.is_failed);
}

#[tokio::test]
async fn test_completed_job_keeps_last_progress() {
    let queue = fast_queue();
    queue.register_fn("q", "t", |_, progress| async move {
        progress.report(10);
        progress.report(40);
        Ok(json!({ "ok": true }))
    });

    let id = queue.submit("q", "t", json!(null)).unwrap().id;
    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert!(status.is_completed);
    assert_eq!(status.progress, 40);
    assert_eq!(status.result, Some(json!({ "ok": true })));
    assert!(status.error.is_none());
    assert!(status.started_at.is_some());
    assert!(status.completed_at.is_some());
    assert!(status.failed_at.is_none());
}

#[tokio::test]
async fn test_failing_handler_runs_exactly_max_attempts() {
    let queue = fast_queue();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    queue.register_fn("q", "t", move |_, _| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err(HandlerError::retryable(format!("attempt {} failed", attempt))) }
    });

    let id = queue.submit("q", "t", json!(null)).unwrap().id;
    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(status.is_failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.error.as_deref(), Some("attempt 3 failed"));
    assert!(status.result.is_none());
    assert!(status.failed_at.is_some());
    assert!(status.completed_at.is_none());
}

#[tokio::test]
async fn test_errors_propagated_with_question_mark_are_retried() {
    let queue = fast_queue();
    let parse_calls = Arc::new(AtomicU32::new(0));
    let internal_calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&parse_calls);
    queue.register_fn("q", "parse", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let parsed: Value = serde_json::from_str("not json")?;
            Ok::<Value, HandlerError>(parsed)
        }
    });
    let counter = Arc::clone(&internal_calls);
    queue.register_fn("q", "internal", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            Err::<Value, HandlerError>(JoblineError::internal("store unavailable").into())
        }
    });

    let parse = queue.submit("q", "parse", json!(null)).unwrap().id;
    let internal = queue.submit("q", "internal", json!(null)).unwrap().id;

    let status = queue.wait_for_terminal(&parse, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 3);
    assert_eq!(parse_calls.load(Ordering::SeqCst), 3);
    assert!(status.error.unwrap().starts_with("invalid JSON"));

    let status = queue.wait_for_terminal(&internal, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 3);
    assert_eq!(internal_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_keeps_progress_and_recovers() {
    let queue = fast_queue();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    queue.register_fn("q", "t", move |_, progress| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt == 1 {
                progress.report(50);
                return Err(HandlerError::retryable("flaky upstream"));
            }
            progress.report(10);
            if attempt == 2 {
                return Err(HandlerError::retryable("still flaky"));
            }
            Ok(json!({ "attempt": attempt }))
        }
    });

    let id = queue.submit("q", "t", json!(null)).unwrap().id;
    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.progress, 50);
    assert_eq!(status.result, Some(json!({ "attempt": 3 })));
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let queue = JobQueue::builder()
        .retry_policy(RetryPolicy::new(
            2,
            BackoffStrategy::fixed(Duration::from_millis(150)),
        ))
        .build()
        .unwrap();
    queue.register_fn("q", "t", |_, _| async { Err(HandlerError::retryable("nope")) });

    let started = std::time::Instant::now();
    let id = queue.submit("q", "t", json!(null)).unwrap().id;
    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_missing_handler_fails_after_single_attempt() {
    let queue = fast_queue();

    let id = queue.submit("q", "unregistered", json!(null)).unwrap().id;
    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 1);
    let error = status.error.unwrap();
    assert!(error.contains("No handler registered"), "{}", error);
    assert!(error.contains("q.unregistered"), "{}", error);
}

#[tokio::test]
async fn test_handler_registered_after_submit_is_used() {
    let queue = fast_queue();
    let id = queue.submit("q", "late", json!(7)).unwrap().id;
    queue.register_fn("q", "late", |payload, _| async move { Ok(payload) });

    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.result, Some(json!(7)));
}

#[test]
fn test_unknown_job_is_not_found() {
    let queue = fast_queue();
    let err = queue.get_status(&JobId::new()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
    assert!(err.is_not_found());
}

// ============================================================================
// Scheduling Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound_is_respected() {
    let queue = JobQueue::builder()
        .queue_concurrency("slow", 2)
        .build()
        .unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        queue.register_fn("slow", "sleep", move |_, _| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });
    }

    let ids: Vec<JobId> = (0..5)
        .map(|i| queue.submit("slow", "sleep", json!(i)).unwrap().id)
        .collect();

    let sampler = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut max_active = 0;
            for _ in 0..60 {
                let stats = queue.stats("slow");
                max_active = max_active.max(stats.active);
                if stats.completed == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            max_active
        })
    };

    for id in &ids {
        let status = queue.wait_for_terminal(id, WAIT).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
    }

    assert!(sampler.await.unwrap() <= 2);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    let stats = queue.stats("slow");
    assert_eq!(stats.concurrency, 2);
    assert_eq!(stats.completed, 5);

    // Permits are released after the terminal snapshot is published.
    let released = tokio::time::timeout(WAIT, async {
        while queue.stats("slow").busy_slots != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(released.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_start_in_submission_order() {
    let queue = JobQueue::builder()
        .queue_concurrency("serial", 1)
        .build()
        .unwrap();

    let started = Arc::new(Mutex::new(Vec::new()));
    {
        let started = Arc::clone(&started);
        queue.register_fn("serial", "record", move |payload, _| {
            started.lock().push(payload.as_i64().unwrap_or(-1));
            async { Ok(json!(null)) }
        });
    }

    let ids: Vec<JobId> = (0..10)
        .map(|i| queue.submit("serial", "record", json!(i)).unwrap().id)
        .collect();
    for id in &ids {
        queue.wait_for_terminal(id, WAIT).await.unwrap();
    }

    assert_eq!(*started.lock(), (0..10).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queues_do_not_block_each_other() {
    let queue = JobQueue::builder().default_concurrency(1).build().unwrap();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    queue.register_fn("blocked", "wait", move |_, _| {
        let mut release = release_rx.clone();
        async move {
            while !*release.borrow() {
                if release.changed().await.is_err() {
                    break;
                }
            }
            Ok(json!(null))
        }
    });
    queue.register_fn("free", "run", |_, _| async { Ok(json!("ran")) });

    let blocked = queue.submit("blocked", "wait", json!(null)).unwrap().id;
    let free = queue.submit("free", "run", json!(null)).unwrap().id;

    let status = queue.wait_for_terminal(&free, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert!(!queue.get_status(&blocked).unwrap().state.is_terminal());

    release_tx.send(true).unwrap();
    let status = queue.wait_for_terminal(&blocked, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
}

// ============================================================================
// Built-in User Processing Tests
// ============================================================================

struct RejectingExecutor {
    rejected: &'static str,
}

#[async_trait]
impl RecordExecutor for RejectingExecutor {
    async fn execute(&self, record: &Value) -> Result<Value, RecordError> {
        match record.get("email").and_then(Value::as_str) {
            Some(email) if email == self.rejected => {
                Err(RecordError::new(format!("user {} already exists", email)))
            }
            Some(email) => Ok(json!({ "created": email })),
            None => Err(RecordError::new("missing email")),
        }
    }
}

#[tokio::test]
async fn test_process_users_with_one_failing_record() {
    let queue = fast_queue();
    setup_user_processing(&queue, RejectingExecutor { rejected: "u2" });

    let id = queue
        .submit(
            USER_PROCESSING_QUEUE,
            PROCESS_USERS_TASK,
            json!({
                "fileName": "users.csv",
                "records": [{ "email": "u1" }, { "email": "u2" }, { "email": "u3" }]
            }),
        )
        .unwrap()
        .id;

    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.file_name.as_deref(), Some("users.csv"));
    assert_eq!(status.total_records, Some(3));

    let summary: BatchSummary = serde_json::from_value(status.result.unwrap()).unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].user, "u2");
    assert_eq!(summary.errors[0].error, "user u2 already exists");
}

#[tokio::test]
async fn test_process_users_without_records_fails_without_retry() {
    let queue = fast_queue();
    setup_user_processing(&queue, RejectingExecutor { rejected: "" });

    let id = queue
        .submit(USER_PROCESSING_QUEUE, PROCESS_USERS_TASK, json!({ "fileName": "x.csv" }))
        .unwrap()
        .id;

    let status = queue.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.error.as_deref(), Some("payload has no records array"));
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lets_running_job_finish() {
    let queue = fast_queue();
    queue.register_fn("q", "slow", |_, _| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!("finished"))
    });

    let id = queue.submit("q", "slow", json!(null)).unwrap().id;
    let (_sub, mut updates) = queue.subscribe_channel(id);
    if queue.get_status(&id).unwrap().state == JobState::Waiting {
        let snapshot = updates.recv().await.unwrap();
        assert_eq!(snapshot.state, JobState::Active);
    }

    queue.shutdown().await;

    let status = queue.get_status(&id).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.result, Some(json!("finished")));

    let err = queue.submit("q", "slow", json!(null)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueShutdown);
}

#[tokio::test]
async fn test_independent_queues_share_nothing() {
    let a = fast_queue();
    let b = fast_queue();
    a.register_fn("q", "t", |_, _| async { Ok(json!("a")) });

    let id = a.submit("q", "t", json!(null)).unwrap().id;
    assert!(b.get_status(&id).is_err());
    assert!(!b.has_handler("q", "t"));

    let status = a.wait_for_terminal(&id, WAIT).await.unwrap();
    assert_eq!(status.result, Some(json!("a")));
}
