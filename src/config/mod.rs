//! Application configuration.
//!
//! Loaded from YAML files and `RELAYMQ__`-prefixed environment variables
//! into typed structs. Every field has a default, so an empty source is valid.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaymq.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYMQ_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYMQ";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYMQ_LOG";

/// Default broker URL.
pub const DEFAULT_AMQP_URL: &str = "amqp://localhost:5672";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client connection and shutdown settings.
    pub client: ClientConfig,
    /// Bridge binary settings.
    pub bridge: BridgeConfig,
}

/// Settings consumed by [`crate::client::Client`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub amqp: AmqpSettings,
    pub shutdown: ShutdownConfig,
}

/// AMQP connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// How often the connection health probe runs, in milliseconds.
    pub probe_interval_ms: u64,
    /// Backoff applied when re-establishing channels and consumers.
    pub reconnect: ReconnectConfig,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_AMQP_URL.to_string(),
            probe_interval_ms: 5_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AmqpSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

/// Shutdown settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on how long close waits for loops to stop. Unset waits forever.
    pub grace_secs: Option<u64>,
}

impl ShutdownConfig {
    pub fn grace(&self) -> Option<Duration> {
        self.grace_secs.map(Duration::from_secs)
    }
}

/// Settings for the `relaymq-bridge` binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Queue to consume from.
    pub source_queue: String,
    /// Exchange to republish into.
    pub target_exchange: String,
    /// Routing key for republished messages.
    pub routing_key: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            source_queue: "relaymq.inbound".to_string(),
            target_exchange: "relaymq.outbound".to_string(),
            routing_key: "#".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaymq.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
