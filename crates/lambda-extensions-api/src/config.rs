//! Configuration loading and management.
//!
//! Configuration is layered with figment. Later sources override earlier ones:
//! 1. Default values (compiled in)
//! 2. Config file: `/opt/extension.toml` (optional)
//! 3. `AWS_LAMBDA_RUNTIME_API`, set by the platform
//! 4. Extension-specific environment variables (`LAMBDA_EXTENSION_*`)
//!
//! Nested keys use a double underscore, e.g.
//! `LAMBDA_EXTENSION_BUFFERING__MAX_ITEMS=1000`.

use crate::env::AWS_LAMBDA_RUNTIME_API;
use crate::subscribe::{BufferingConfig, SubscriptionType};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/opt/extension.toml";
const ENV_PREFIX: &str = "LAMBDA_EXTENSION_";

/// Default address the receiver binds to. Port 0 picks a free port.
pub const DEFAULT_DESTINATION_ADDR: &str = "sandbox.localdomain:0";

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Name to register under. Defaults to the executable file name.
    pub extension_name: Option<String>,
    /// Runtime API address, `host:port`.
    pub runtime_api: Option<String>,
    /// Address the receiver binds to; its host is also used in the
    /// subscription URI.
    pub destination_addr: String,
    /// Buffering thresholds for the subscription.
    pub buffering: Option<BufferingSettings>,
    /// Record kinds for a Telemetry API subscription.
    pub telemetry_types: Vec<SubscriptionType>,
    /// Record kinds for a Logs API subscription.
    pub log_types: Vec<SubscriptionType>,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            extension_name: None,
            runtime_api: None,
            destination_addr: DEFAULT_DESTINATION_ADDR.to_string(),
            buffering: None,
            telemetry_types: Vec::new(),
            log_types: Vec::new(),
        }
    }
}

impl ExtensionConfig {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(ExtensionConfig::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(standard_lambda_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract()
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Returns the buffering thresholds in subscription form.
    pub fn buffering_config(&self) -> Option<BufferingConfig> {
        self.buffering.as_ref().map(BufferingSettings::to_buffering_config)
    }
}

/// Buffering thresholds as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingSettings {
    /// Maximum records per batch.
    pub max_items: u32,
    /// Maximum batch size in bytes.
    pub max_bytes: u32,
    /// Maximum buffering delay in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for BufferingSettings {
    fn default() -> Self {
        let platform = BufferingConfig::default();

        Self {
            max_items: platform.max_items,
            max_bytes: platform.max_bytes,
            timeout: Duration::from_millis(u64::from(platform.timeout_ms)),
        }
    }
}

impl BufferingSettings {
    fn to_buffering_config(&self) -> BufferingConfig {
        BufferingConfig {
            max_items: self.max_items,
            max_bytes: self.max_bytes,
            timeout_ms: u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: ExtensionConfig,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: ExtensionConfig::default(),
        }
    }

    /// Sets the extension name.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension_name = Some(name.into());
        self
    }

    /// Sets the runtime API address.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.runtime_api = Some(address.into());
        self
    }

    /// Sets the receiver bind address.
    pub fn destination_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.destination_addr = addr.into();
        self
    }

    /// Sets the buffering thresholds.
    pub fn buffering(mut self, buffering: BufferingSettings) -> Self {
        self.config.buffering = Some(buffering);
        self
    }

    /// Sets the Telemetry API record kinds.
    pub fn telemetry_types(mut self, types: impl Into<Vec<SubscriptionType>>) -> Self {
        self.config.telemetry_types = types.into();
        self
    }

    /// Sets the Logs API record kinds.
    pub fn log_types(mut self, types: impl Into<Vec<SubscriptionType>>) -> Self {
        self.config.log_types = types.into();
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ExtensionConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial config for the variables the platform sets itself.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
}

fn standard_lambda_env() -> Serialized<PartialConfig> {
    let config = PartialConfig {
        runtime_api: std::env::var(AWS_LAMBDA_RUNTIME_API)
            .ok()
            .filter(|value| !value.is_empty()),
    };

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
