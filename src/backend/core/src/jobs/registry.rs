//! Task handler registry.
//!
//! Maps `(queue name, task type)` to a [`TaskHandler`]. Handlers are stored
//! type-erased behind `Arc<dyn TaskHandler>` so one registry can hold any mix
//! of implementations, including plain async closures via [`handler_fn`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{ErrorCode, JoblineError};

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure returned by a handler invocation.
///
/// Retryable errors are retried by the executor until the job's attempt limit
/// is reached; fatal errors fail the job immediately. Errors converted with
/// `?` are always retryable; only [`HandlerError::fatal`] opts out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    /// Error message
    pub message: String,
    /// Whether another attempt may help
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl HandlerError {
    /// Create a new retryable error.
    pub fn new(message: impl Into<String>) -> Self {
        Self::retryable(message)
    }

    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for HandlerError {}

impl From<JoblineError> for HandlerError {
    fn from(error: JoblineError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: true,
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::retryable(format!("invalid JSON: {}", error))
            .with_code(ErrorCode::SerializationError.to_string())
    }
}

/// Result type for handler invocations.
pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Progress Reporting
// ═══════════════════════════════════════════════════════════════════════════════

/// Synchronous progress callback handed to each handler invocation.
///
/// Each call is applied to the job before `report` returns, so listeners see
/// progress before the handler's final result.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u8) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report completion percentage. Values above 100 are clamped.
    pub fn report(&self, percent: u32) {
        (self.sink)(percent.min(100) as u8);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Work performed for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Process `payload`, optionally reporting progress along the way.
    async fn handle(&self, payload: &serde_json::Value, progress: &ProgressReporter)
        -> HandlerResult;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
///
/// The closure receives owned copies of the payload and progress reporter.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(
        &self,
        payload: &serde_json::Value,
        progress: &ProgressReporter,
    ) -> HandlerResult {
        (self.f)(payload.clone(), progress.clone()).await
    }

    fn name(&self) -> &str {
        "fn_handler"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing key of a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub queue_name: String,
    pub task_type: String,
}

impl HandlerKey {
    pub fn new(queue_name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            task_type: task_type.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.queue_name, self.task_type)
    }
}

/// Registry of handlers, keyed by queue and task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<HandlerKey, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A previous handler for the same key is replaced.
    pub fn register(
        &self,
        queue_name: impl Into<String>,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        let key = HandlerKey::new(queue_name, task_type);
        let handler_name = handler.name().to_string();

        if self.handlers.insert(key.clone(), handler).is_some() {
            tracing::warn!(
                queue = %key.queue_name,
                task_type = %key.task_type,
                handler = %handler_name,
                "Replacing previously registered task handler"
            );
        } else {
            tracing::info!(
                queue = %key.queue_name,
                task_type = %key.task_type,
                handler = %handler_name,
                "Registered task handler"
            );
        }
    }

    /// Look up the handler for a job's routing key.
    pub fn resolve(&self, queue_name: &str, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&HandlerKey::new(queue_name, task_type))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, queue_name: &str, task_type: &str) -> bool {
        self.handlers
            .contains_key(&HandlerKey::new(queue_name, task_type))
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.handlers.iter().map(|e| e.key().clone()).collect();
        keys.sort_by(|a, b| {
            (a.queue_name.as_str(), a.task_type.as_str())
                .cmp(&(b.queue_name.as_str(), b.task_type.as_str()))
        });
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
