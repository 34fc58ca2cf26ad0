//! Configuration system for the MQTT TLS client
//!
//! Configuration is resolved in layers: built-in defaults, an optional TOML
//! file, then environment variables and command line flags (both carried by
//! [`ConnectionArgs`]). The resolved [`ClientConfig`] is validated once and is
//! read-only afterwards.

use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Resolved client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker endpoint and session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker hostname or IP
    pub host: String,
    /// Broker TLS port
    pub port: u16,
    /// Topic used for both publishing and subscribing
    pub topic: String,
    pub username: String,
    pub password: String,
    /// Client identifier (generated when omitted)
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Maximum wait for the initial CONNACK in seconds
    pub connect_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8883,
            topic: "golang-mqtt/test".to_string(),
            username: "emqx".to_string(),
            password: "public".to_string(),
            client_id: None,
            keep_alive_secs: 3,
            connect_timeout_secs: 5,
        }
    }
}

/// Trust and identity material
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsSection {
    /// PEM bundle of trusted CA certificates
    pub cafile: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
}

/// Publisher and subscriber timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub interval_secs: u64,
    pub subscribe_ack_timeout_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            subscribe_ack_timeout_secs: 3,
        }
    }
}

/// Reconnect backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub first_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub multiplier: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            first_delay_secs: 1,
            max_delay_secs: 60,
            max_attempts: 12,
            multiplier: 2,
        }
    }
}

/// Connection flags shared by every subcommand.
///
/// Each flag can also come from the environment. Empty strings count as unset
/// so `--cafile ""` behaves like omitting the flag.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConnectionArgs {
    /// Server hostname or IP
    #[arg(long, env = "MQTT_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "MQTT_PORT")]
    pub port: Option<u16>,

    /// Publish/subscribe topic
    #[arg(long, env = "MQTT_TOPIC")]
    pub topic: Option<String>,

    /// Username
    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// Password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Path to a file containing trusted CA certificates
    #[arg(long, env = "MQTT_CAFILE", value_name = "FILE")]
    pub cafile: Option<String>,

    /// Client certificate for authentication, if required by server
    #[arg(long, env = "MQTT_CERT", value_name = "FILE")]
    pub cert: Option<String>,

    /// Client private key for authentication, if required by server
    #[arg(long, env = "MQTT_KEY", value_name = "FILE")]
    pub key: Option<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file. Missing sections take defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the final configuration from an optional file and CLI/env flags
    pub fn resolve(path: Option<&Path>, args: &ConnectionArgs) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    /// Overlay flags that were given on top of the current values
    pub fn apply_overrides(&mut self, args: &ConnectionArgs) {
        if let Some(host) = &args.host {
            self.mqtt.host = host.clone();
        }
        if let Some(port) = args.port {
            self.mqtt.port = port;
        }
        if let Some(topic) = &args.topic {
            self.mqtt.topic = topic.clone();
        }
        if let Some(username) = &args.username {
            self.mqtt.username = username.clone();
        }
        if let Some(password) = &args.password {
            self.mqtt.password = password.clone();
        }
        if let Some(cafile) = &args.cafile {
            self.tls.cafile = non_empty_path(cafile);
        }
        if let Some(cert) = &args.cert {
            self.tls.cert = non_empty_path(cert);
        }
        if let Some(key) = &args.key {
            self.tls.key = non_empty_path(key);
        }
    }

    /// Validate the resolved configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("host must not be empty".into()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig("port must be non-zero".into()));
        }
        validate_publish_topic(&self.mqtt.topic)?;
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be at least 1".into(),
            ));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.publish.interval_secs == 0 || self.publish.subscribe_ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish interval and subscribe ack timeout must be greater than 0".into(),
            ));
        }
        self.reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    /// Broker endpoint in `tls://host:port` form
    pub fn broker_uri(&self) -> String {
        format!("tls://{}:{}", self.mqtt.host, self.mqtt.port)
    }

    /// Client id to present to the broker
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-tls-client-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.connect_timeout_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish.interval_secs)
    }

    pub fn subscribe_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.publish.subscribe_ack_timeout_secs)
    }

    /// Backoff parameters for reconnect episodes
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            first_delay: Duration::from_secs(self.reconnect.first_delay_secs),
            max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
            max_attempts: self.reconnect.max_attempts,
            multiplier: self.reconnect.multiplier,
        }
    }

    /// Copy of the configuration that is safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.mqtt.password.is_empty() {
            config.mqtt.password = "***".to_string();
        }
        config
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

/// Topics must be non-empty. A wildcard topic is still accepted: the
/// subscription works and each publish is rejected and logged per tick.
fn validate_publish_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::InvalidConfig("topic must not be empty".into()));
    }
    if has_wildcard(topic) {
        warn!(
            topic = %topic,
            "Topic contains wildcards; publishes to it will be rejected"
        );
    }
    Ok(())
}

/// True when the topic holds an MQTT wildcard (`+` or `#`)
pub fn has_wildcard(topic: &str) -> bool {
    topic.contains(&['+', '#'][..])
}
