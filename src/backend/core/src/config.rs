//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{JoblineError, Result};
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};
use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Per-queue worker pool sizing
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Retry policy applied to whole handler invocations
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Retry policy applied to individual records inside a batch
    #[serde(default = "default_record_retry")]
    pub record_retry: RetryPolicy,

    /// External user service called by the import worker
    #[serde(default)]
    pub user_api: UserApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: QueuesConfig::default(),
            retry: RetryPolicy::default(),
            record_retry: default_record_retry(),
            user_api: UserApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Concurrency for queues without an explicit override
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Concurrency by queue name
    #[serde(default)]
    pub overrides: HashMap<String, usize>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            overrides: HashMap::new(),
        }
    }
}

impl QueuesConfig {
    /// Concurrency bound for the named queue.
    pub fn concurrency_for(&self, queue_name: &str) -> usize {
        self.overrides
            .get(queue_name)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserApiConfig {
    /// Base URL; users are created at `{url}/users`
    #[serde(default = "default_user_api_url")]
    pub url: String,

    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: String,

    /// Per-request timeout
    #[serde(default = "default_user_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UserApiConfig {
    fn default() -> Self {
        Self {
            url: default_user_api_url(),
            api_key: String::new(),
            timeout: default_user_api_timeout(),
        }
    }
}

// Default value functions
fn default_concurrency() -> usize { 5 }
fn default_user_api_url() -> String { "https://api.example.com".to_string() }
fn default_user_api_timeout() -> Duration { Duration::from_secs(10) }
fn default_record_retry() -> RetryPolicy {
    RetryPolicy::new(
        3,
        BackoffStrategy::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(1),
        },
    )
}

impl Config {
    /// Load configuration from the environment (`JOBLINE__` prefix).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("JOBLINE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("JOBLINE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queues.default_concurrency == 0 {
            return Err(JoblineError::invalid_config(
                "queues.default_concurrency must be at least 1",
            ));
        }
        if let Some((name, _)) = self.queues.overrides.iter().find(|(_, n)| **n == 0) {
            return Err(JoblineError::invalid_config(format!(
                "queues.overrides.{} must be at least 1",
                name
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(JoblineError::invalid_config("retry.max_attempts must be at least 1"));
        }
        if self.record_retry.max_attempts == 0 {
            return Err(JoblineError::invalid_config(
                "record_retry.max_attempts must be at least 1",
            ));
        }
        if self.user_api.url.trim().is_empty() {
            return Err(JoblineError::invalid_config("user_api.url must not be empty"));
        }
        if self.user_api.timeout.is_zero() {
            return Err(JoblineError::invalid_config("user_api.timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queues.default_concurrency, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_record_retry_default_is_linear() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.record_retry.max_attempts, 3);
        assert_eq!(config.record_retry.delay_before_retry(1), Duration::from_secs(1));
        assert_eq!(config.record_retry.delay_before_retry(2), Duration::from_secs(2));
    }

    #[test]
    fn test_concurrency_override() {
        let mut queues = QueuesConfig::default();
        queues.overrides.insert("imports".to_string(), 2);
        assert_eq!(queues.concurrency_for("imports"), 2);
        assert_eq!(queues.concurrency_for("other"), 5);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.queues.default_concurrency = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[queues]
default_concurrency = 8

[queues.overrides]
slow = 1

[retry]
max_attempts = 4

[retry.backoff]
fixed = {{ delay = "250ms" }}

[user_api]
url = "http://users.internal:8080"
api_key = "secret"
timeout = "3s"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.queues.default_concurrency, 8);
        assert_eq!(config.queues.concurrency_for("slow"), 1);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.delay_before_retry(3), Duration::from_millis(250));
        assert_eq!(config.user_api.url, "http://users.internal:8080");
        assert_eq!(config.user_api.api_key, "secret");
        assert_eq!(config.user_api.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_user_api_defaults() {
        let config = Config::default();
        assert_eq!(config.user_api.url, "https://api.example.com");
        assert!(config.user_api.api_key.is_empty());
        assert_eq!(config.user_api.timeout, Duration::from_secs(10));

        let mut config = Config::default();
        config.user_api.timeout = Duration::ZERO;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);
    }
}
