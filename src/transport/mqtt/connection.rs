//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! backoff configuration and MQTT option construction.

use crate::config::ClientConfig;
use crate::tls::SecurityContext;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first CONNACK
    Connecting,
    /// Handshake complete, transport open
    Connected,
    /// Reconnect episode in progress; `delay` precedes `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget spent without getting the connection back
    Exhausted { attempts: u32 },
    /// Closed for good: the initial connect failed or the client disconnected
    Failed(String),
}

impl ConnectionState {
    /// Only a completed handshake counts as open
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Connection lifecycle notifications broadcast to observers
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Handshake complete; `reconnected` is false for the initial connect
    Connected { reconnected: bool },
    ConnectionLost { reason: String },
    /// About to wait `delay` before reconnect attempt `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget spent; the exit flag has been raised
    Exhausted { attempts: u32 },
}

/// Bounded exponential backoff for reconnect episodes
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt of an episode
    pub first_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Attempts per episode before giving up
    pub max_attempts: u32,
    /// Factor applied to the delay after each failed attempt
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 12,
            multiplier: 2,
        }
    }
}

impl ReconnectConfig {
    /// Delay following `current` after a failed attempt, clamped to `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .checked_mul(self.multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay that precedes the given 1-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.first_delay.min(self.max_delay);
        for _ in 1..attempt {
            delay = self.next_delay(delay);
        }
        delay
    }

    /// Every delay of a full episode, in order
    pub fn delay_sequence(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }

    /// Total time spent sleeping by an episode that exhausts its budget
    pub fn calculate_max_total_time(&self) -> Duration {
        self.delay_sequence().into_iter().sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.multiplier == 0 {
            return Err("multiplier must be at least 1".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("max_delay must be greater than 0".to_string());
        }
        if self.first_delay > self.max_delay {
            return Err("first_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection to {broker} not acknowledged within {timeout:?}")]
    ConnectTimeout { broker: String, timeout: Duration },
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to {topic} rejected by broker")]
    SubscriptionRejected { topic: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Host and port of a `tls://` broker URI
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// Parse a broker URI. Only TLS schemes are accepted.
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, MqttError> {
    let url = Url::parse(uri).map_err(|_| MqttError::InvalidBrokerUrl(uri.to_string()))?;

    if !matches!(url.scheme(), "tls" | "ssl" | "mqtts") {
        return Err(MqttError::InvalidBrokerUrl(uri.to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(uri.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(8883);

    Ok(BrokerAddress { host, port })
}

/// Build MQTT options from configuration and a TLS context
pub fn configure_mqtt_options(
    config: &ClientConfig,
    security: SecurityContext,
) -> Result<MqttOptions, MqttError> {
    let broker = parse_broker_uri(&config.broker_uri())?;

    let mut mqtt_options = MqttOptions::new(config.client_id(), broker.host, broker.port);
    mqtt_options.set_credentials(&config.mqtt.username, &config.mqtt.password);
    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_session(true);

    let transport: RumqttcTransport = security.into_transport();
    mqtt_options.set_transport(transport);

    Ok(mqtt_options)
}
