//! Configuration management.
//!
//! Settings come from an optional file plus `KEYSTONE__*` environment
//! variables, e.g. `KEYSTONE__ENGINE__PAYLOAD_MODE=strip` or
//! `KEYSTONE__WORKER__POLL_INTERVAL=500ms`.

use serde::Deserialize;
use std::path::PathBuf;

use crate::notify::{QueueConfig, RetryPolicy, WorkerConfig};
use crate::policy::ANONYMOUS_ROLE;
use crate::surface::PayloadMode;
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "KEYSTONE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging and service identity
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Authorization engine behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Delivery queue
    #[serde(default)]
    pub queue: QueueConfig,

    /// Delivery worker pool
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Delivery retry behaviour
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How write payloads with unpermitted attributes are handled
    #[serde(default)]
    pub payload_mode: PayloadMode,

    /// Role used for requests without a principal
    #[serde(default = "default_anonymous_role")]
    pub anonymous_role: String,

    /// Policy manifest loaded at startup
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payload_mode: PayloadMode::default(),
            anonymous_role: default_anonymous_role(),
            manifest: None,
        }
    }
}

fn default_anonymous_role() -> String {
    ANONYMOUS_ROLE.to_string()
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
