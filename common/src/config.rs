// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::DelaySettings;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub storage: StorageConfig,
    pub actuator: ActuatorConfig,
    pub runner: RunnerConfig,
    pub delays: DelaySettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the JSON document holding all persisted state.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Base URL of the local automation endpoint performing page work.
    pub endpoint: String,
    /// Client-side timeout for actuator calls. The runner itself applies
    /// no outer timeout, so this is the only bound on a hung actuation.
    pub timeout_seconds: u64,
    /// Feature name consulted through the entitlement checker before
    /// daily bulk dispatch.
    pub bulk_feature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Poll interval jitter bounds, inclusive, in seconds.
    pub poll_min_seconds: u64,
    pub poll_max_seconds: u64,
    /// Template used to turn a content identifier into a page URL.
    /// "{urn}" is replaced with the dequeued identifier.
    pub target_url_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// Prometheus exporter port; metrics are recorded but not exported
    /// when unset.
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.path.is_empty() {
            return Err("Storage path cannot be empty".to_string());
        }

        if self.actuator.endpoint.is_empty() {
            return Err("Actuator endpoint cannot be empty".to_string());
        }
        if self.actuator.timeout_seconds == 0 {
            return Err("Actuator timeout_seconds must be greater than 0".to_string());
        }
        if self.actuator.bulk_feature.is_empty() {
            return Err("Actuator bulk_feature cannot be empty".to_string());
        }

        if self.runner.poll_min_seconds == 0 {
            return Err("Runner poll_min_seconds must be greater than 0".to_string());
        }
        if self.runner.poll_min_seconds > self.runner.poll_max_seconds {
            return Err("Runner poll interval bounds must satisfy min <= max".to_string());
        }
        if !self.runner.target_url_template.contains("{urn}") {
            return Err("Runner target_url_template must contain {urn}".to_string());
        }

        self.delays
            .validate()
            .map_err(|e| format!("Invalid delay settings: {}", e))?;

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                path: "data/state.json".to_string(),
            },
            actuator: ActuatorConfig {
                endpoint: "http://127.0.0.1:9321".to_string(),
                timeout_seconds: 120,
                bulk_feature: "bulk_engagement".to_string(),
            },
            runner: RunnerConfig {
                poll_min_seconds: 20,
                poll_max_seconds: 30,
                target_url_template: "https://www.linkedin.com/feed/update/{urn}/".to_string(),
            },
            delays: DelaySettings::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
            },
        }
    }
}
