//! HTTP client for the external user service.
//!
//! [`HttpUserExecutor`] is the [`RecordExecutor`] the import worker runs
//! records through: every record is POSTed as JSON to `{url}/users` with a
//! bearer token. Failures come back as [`RecordError`]s whose messages are
//! stored in the batch summary.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::builtin::{RecordError, RecordExecutor};
use crate::config::UserApiConfig;

/// Error message for requests that got no response.
pub const NO_RESPONSE: &str = "API request timeout or no response";

/// Creates users through the user service's REST API.
#[derive(Debug, Clone)]
pub struct HttpUserExecutor {
    client: Client,
    users_url: String,
    api_key: String,
}

impl HttpUserExecutor {
    pub fn new(config: &UserApiConfig) -> crate::error::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            users_url: format!("{}/users", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }

    pub fn users_url(&self) -> &str {
        &self.users_url
    }

    /// Create one user and return the service's response body.
    ///
    /// Non-2xx responses fail with `API error (<status>): <body>`.
    pub async fn add_user(&self, user: &Value) -> Result<Value, RecordError> {
        let response = self
            .client
            .post(&self.users_url)
            .bearer_auth(&self.api_key)
            .json(user)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                body = %body,
                "User API rejected record"
            );
            return Err(RecordError::new(format!(
                "API error ({}): {}",
                status.as_u16(),
                body
            )));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

fn request_error(error: reqwest::Error) -> RecordError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        tracing::warn!(error = %error, "User API gave no response");
        RecordError::new(NO_RESPONSE)
    } else {
        tracing::warn!(error = %error, "User API request failed");
        RecordError::new(error.to_string())
    }
}

#[async_trait]
impl RecordExecutor for HttpUserExecutor {
    async fn execute(&self, record: &Value) -> Result<Value, RecordError> {
        self.add_user(record).await
    }
}
