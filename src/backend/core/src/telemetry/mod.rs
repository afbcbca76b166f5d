//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: JSON/pretty/compact logging through `tracing-subscriber`
//! - **Metrics**: counters recorded through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use keystone_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, DeliveryMetrics};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "keystone".to_string()
}

fn default_environment() -> String {
    std::env::var("KEYSTONE_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Install the log subscriber and register metric descriptions.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging, &config.environment)?;
    describe_metrics();

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );
    Ok(())
}
