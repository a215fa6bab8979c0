//! Telemetry: structured logging and job metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing-subscriber` output with per-module filters
//! - **Metrics**: job lifecycle counters, gauges and histograms over the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use jobline_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use self::metrics::{FailureReason, JobMetrics};

use serde::Deserialize;

use crate::error::Result;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "jobline".to_string()
}

/// Initialize logging and describe metrics.
///
/// Call once at application startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    init_logging(&config.logging)?;
    JobMetrics::describe();

    ::tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );
    Ok(())
}
