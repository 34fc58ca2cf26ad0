//! Periodic publisher and per-handshake subscriber
//!
//! Both sides only talk to a [`Transport`], so they run unchanged against the
//! MQTT client or a mock.

use crate::exit::ExitFlag;
use crate::transport::mqtt::{InboundMessage, LifecycleEvent, MessageCallback};
use crate::transport::Transport;
use chrono::{DateTime, Local};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Counters reported when the publisher stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    /// Ticks skipped because the transport was closed
    pub skipped: u64,
}

/// Result of one subscribe call
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    Acknowledged(QoS),
    Failed(String),
    TimedOut,
}

/// Payload published on every tick
pub fn timestamp_payload(now: DateTime<Local>) -> String {
    format!("The current time {}", now.format("%Y-%m-%d %H:%M:%S%.9f %:z"))
}

/// Callback that logs every received message
pub fn log_message_callback() -> MessageCallback {
    Arc::new(|message: &InboundMessage| {
        info!(
            "sub [{}] {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
    })
}

/// Publish a timestamp to `topic` once per `interval` until the exit flag is
/// raised. Ticks with a closed transport are skipped, not buffered.
pub async fn run_publisher<T>(
    transport: &T,
    topic: &str,
    interval: Duration,
    exit: &ExitFlag,
) -> PublisherStats
where
    T: Transport + ?Sized,
{
    let span = crate::mqtt_span!(operation = "publisher", topic = %topic);

    async move {
        let mut stats = PublisherStats::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = exit.wait() => break,
                _ = ticker.tick() => {}
            }

            if !transport.is_connection_open() {
                stats.skipped += 1;
                continue;
            }

            let payload = timestamp_payload(Local::now());
            match transport
                .publish(topic, QoS::AtMostOnce, false, payload.clone().into_bytes())
                .await
            {
                Ok(()) => {
                    info!("pub {} to topic [{}]", payload, topic);
                    stats.published += 1;
                }
                Err(e) => {
                    warn!("pub message to topic {} error: {}", topic, e);
                    stats.failed += 1;
                }
            }
        }

        info!(
            published = stats.published,
            failed = stats.failed,
            skipped = stats.skipped,
            "Publisher stopped"
        );
        stats
    }
    .instrument(span)
    .await
}

/// Subscribe to `topic` at QoS 0 with the logging callback and wait up to
/// `ack_timeout` for the acknowledgement. Failures are logged, never raised.
pub async fn subscribe_topic<T>(transport: &T, topic: &str, ack_timeout: Duration) -> SubscribeOutcome
where
    T: Transport + ?Sized,
{
    let subscription = transport.subscribe(topic, QoS::AtMostOnce, log_message_callback());

    match tokio::time::timeout(ack_timeout, subscription).await {
        Ok(Ok(qos)) => {
            debug!("Subscribed to {} (granted {:?})", topic, qos);
            SubscribeOutcome::Acknowledged(qos)
        }
        Ok(Err(e)) => {
            warn!("sub to message error from topic {}: {}", topic, e);
            SubscribeOutcome::Failed(e.to_string())
        }
        Err(_) => {
            warn!("sub to topic timeout: {}", topic);
            SubscribeOutcome::TimedOut
        }
    }
}

/// Subscribe in the background on every completed handshake.
///
/// Runs until the lifecycle channel closes and returns how many handshakes
/// it reacted to.
pub async fn run_subscription_hook<T>(
    transport: Arc<T>,
    topic: String,
    mut events: broadcast::Receiver<LifecycleEvent>,
    ack_timeout: Duration,
) -> usize
where
    T: Transport + 'static,
{
    let mut handshakes = 0;

    loop {
        match events.recv().await {
            Ok(LifecycleEvent::Connected { reconnected }) => {
                handshakes += 1;
                let transport = transport.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    subscribe_topic(transport.as_ref(), &topic, ack_timeout).await;
                });
                info!(reconnected, "Connected to MQTT Broker!");
            }
            Ok(LifecycleEvent::Exhausted { attempts }) => {
                debug!("Lifecycle: reconnect exhausted after {} attempts", attempts);
            }
            Ok(other) => debug!("Lifecycle: {:?}", other),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Subscription hook missed {} lifecycle events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    handshakes
}
