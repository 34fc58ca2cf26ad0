//! MQTT client over mutual TLS with bounded reconnect
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Connection state, backoff configuration and MQTT options
//! - [`reconnect`] - Pure reconnect state machine
//! - [`episode`] - Async executor for one reconnect episode
//! - [`message_handler`] - Event routing, topic matching and SUBACK tracking
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_tls_client::config::ClientConfig;
//! use mqtt_tls_client::exit::ExitFlag;
//! use mqtt_tls_client::tls::SecurityContext;
//! use mqtt_tls_client::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::default();
//! let security = SecurityContext::load(&config.tls)?;
//!
//! let client = MqttClient::new(&config, security, ExitFlag::new())?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod episode;
pub mod message_handler;
pub mod reconnect;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{
    parse_broker_uri, BrokerAddress, ConnectionState, LifecycleEvent, MqttError, ReconnectConfig,
};
pub use episode::{run_reconnect_episode, EpisodeOutcome, Reconnector};
pub use message_handler::{
    topic_matches, EventRoute, InboundMessage, MessageCallback, MessageHandler,
    SubscriptionRegistry,
};
pub use reconnect::{LinkAction, LinkEvent, ReconnectPolicy, Transition};
