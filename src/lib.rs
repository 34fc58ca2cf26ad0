//! MQTT TLS Client
//!
//! A mutual-TLS MQTT client that publishes a timestamp every second,
//! subscribes to the same topic on every handshake and reconnects with a
//! bounded exponential backoff.
//!
//! # Overview
//!
//! - [`tls`] builds the rustls context from a CA bundle and client identity
//! - [`transport::mqtt`] owns the broker connection and its reconnect episodes
//! - [`pubsub`] runs the periodic publisher and the subscription hook
//! - [`exit::ExitFlag`] tells the publisher to stop once reconnects run out
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_tls_client::{ClientConfig, ExitFlag, MqttClient, SecurityContext};
//! use mqtt_tls_client::pubsub::run_publisher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::default();
//! let security = SecurityContext::load(&config.tls)?;
//! let exit = ExitFlag::new();
//!
//! let client = MqttClient::new(&config, security, exit.clone())?;
//! client.connect().await?;
//!
//! let stats = run_publisher(&client, &config.mqtt.topic, config.publish_interval(), &exit).await;
//! println!("published {} messages", stats.published);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exit;
pub mod observability;
pub mod pubsub;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::{ClientConfig, ConfigError, ConnectionArgs};
pub use error::{ClientError, ClientResult};
pub use exit::ExitFlag;
pub use tls::{SecurityContext, TlsError};
pub use transport::mqtt::{ConnectionState, LifecycleEvent, MqttClient, MqttError};
pub use transport::Transport;
