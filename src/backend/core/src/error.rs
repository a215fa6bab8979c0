//! Error handling for Jobline Core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - User-facing vs internal messages
//! - Severity-driven logging through `tracing`
//! - An error counter through the `metrics` facade
//!
//! Errors raised *inside* a job attempt never reach the submitter: the executor
//! converts them into job state transitions. The variants here surface on the
//! caller-facing API (`get_status`, `submit`, configuration loading).
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobline_core::error::{JoblineError, Result, ErrorContext, ErrorCode};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("queues.toml")
//!         .with_error_code(ErrorCode::MissingConfiguration)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for Jobline operations.
pub type Result<T> = std::result::Result<T, JoblineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    HandlerMissing,
    HandlerExecutionFailed,
    InvalidPayload,
    QueueShutdown,

    // Notification Errors (1100-1199)
    ListenerFailed,

    // Serialization Errors (2200-2299)
    SerializationError,

    // External Service Errors (3000-3099)
    NetworkError,
    ExternalServiceError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    Timeout,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::HandlerMissing => 1001,
            Self::HandlerExecutionFailed => 1002,
            Self::InvalidPayload => 1003,
            Self::QueueShutdown => 1004,

            Self::ListenerFailed => 1100,

            Self::SerializationError => 2200,

            Self::NetworkError => 3000,
            Self::ExternalServiceError => 3001,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::Timeout => 9001,
        }
    }

    /// Check if an attempt failing with this code may be retried.
    ///
    /// A missing handler stays missing for the lifetime of the attempt, so it
    /// is the one job-level failure that is never retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandlerExecutionFailed
                | Self::Timeout
                | Self::NetworkError
                | Self::ExternalServiceError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "notification",
            2200..=2299 => "serialization",
            3000..=3099 => "external",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown ids, bad payloads)
    Low,
    /// Operational issues (handler failures, listener panics)
    Medium,
    /// Misconfiguration
    High,
    /// Bugs and broken invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound | ErrorCode::InvalidPayload | ErrorCode::QueueShutdown => {
                Self::Low
            }

            ErrorCode::HandlerMissing
            | ErrorCode::HandlerExecutionFailed
            | ErrorCode::ListenerFailed
            | ErrorCode::Timeout
            | ErrorCode::NetworkError
            | ErrorCode::ExternalServiceError => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Jobline Core.
#[derive(Error, Debug)]
pub struct JoblineError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for JoblineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl JoblineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error for a job id.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
    }

    /// Create a missing handler error.
    pub fn handler_missing(queue_name: &str, task_type: &str) -> Self {
        Self::new(
            ErrorCode::HandlerMissing,
            format!("No handler registered for {}.{}", queue_name, task_type),
        )
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::JobNotFound
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "jobline_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| JoblineError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| JoblineError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| JoblineError::new(ErrorCode::JobNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| JoblineError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for JoblineError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for JoblineError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::Type { .. } | config::ConfigError::Message(_) => (
                ErrorCode::InvalidConfiguration,
                "Configuration value is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Failed to load configuration"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tracing_subscriber::filter::ParseError> for JoblineError {
    fn from(error: tracing_subscriber::filter::ParseError) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Invalid log filter directive",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for JoblineError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for JoblineError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::Timeout, "External service request timed out")
        } else if error.is_connect() || error.is_request() {
            (ErrorCode::NetworkError, "Failed to reach external service")
        } else if error.is_builder() {
            (ErrorCode::ConfigurationError, "Failed to build HTTP client")
        } else {
            (ErrorCode::ExternalServiceError, "External service error")
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for JoblineError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<JoblineError>() {
            Ok(jobline_error) => jobline_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}
