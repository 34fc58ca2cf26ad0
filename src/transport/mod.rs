//! Transport layer for the pub/sub loop
//!
//! The [`Transport`] trait is the seam between the publisher/subscriber logic
//! and the MQTT client, so the loop can be driven by a mock in tests.

use crate::transport::mqtt::{ConnectionState, MessageCallback};
use rumqttc::QoS;

pub mod mqtt;

/// Publish/subscribe operations over a broker connection
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a payload to `topic`
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error>;

    /// Subscribe to `topic`, resolving with the granted QoS once acknowledged
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<QoS, Self::Error>;

    /// Check if the transport is currently open
    fn is_connection_open(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;
}
