//! Mock implementations for testing
//!
//! Provides a mock [`Transport`] and a scripted [`Reconnector`].

use crate::transport::mqtt::{
    ConnectionState, MessageCallback, MqttError, Reconnector,
};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub type PublishedMessage = (String, Vec<u8>);

/// How [`MockTransport::subscribe`] answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscribeBehavior {
    /// Acknowledge with the requested QoS
    #[default]
    Acknowledge,
    /// Broker rejects the filter
    Reject,
    /// Never answer
    Hang,
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    open: AtomicBool,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    pub subscribe_behavior: SubscribeBehavior,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            published_messages: Arc::default(),
            subscriptions: Arc::default(),
            should_fail: false,
            subscribe_behavior: SubscribeBehavior::default(),
        }
    }
}

impl MockTransport {
    /// An open transport that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// An open transport whose publishes fail
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    /// A transport that starts closed
    pub fn closed() -> Self {
        let transport = Self::default();
        transport.set_open(false);
        transport
    }

    pub fn with_subscribe_behavior(mut self, behavior: SubscribeBehavior) -> Self {
        self.subscribe_behavior = behavior;
        self
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn publish(
        &self,
        topic: &str,
        _qos: QoS,
        _retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error> {
        if !self.is_connection_open() {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        if self.should_fail {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        _callback: MessageCallback,
    ) -> Result<QoS, Self::Error> {
        self.subscriptions.lock().await.push(topic.to_string());

        match self.subscribe_behavior {
            SubscribeBehavior::Acknowledge => Ok(qos),
            SubscribeBehavior::Reject => Err(MqttError::SubscriptionRejected {
                topic: topic.to_string(),
            }),
            SubscribeBehavior::Hang => std::future::pending().await,
        }
    }

    fn is_connection_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connection_open() {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: std::time::Duration::from_secs(1),
            }
        }
    }
}

/// Reconnector that follows a fixed script
#[derive(Debug, Clone, Default)]
pub struct MockReconnector {
    /// 1-based attempt that succeeds; `None` fails forever
    succeed_on: Option<usize>,
    /// Succeeding attempts leave the transport closed
    report_closed: bool,
    attempts: Arc<AtomicUsize>,
    attempt_times: Arc<std::sync::Mutex<Vec<Instant>>>,
    open: bool,
}

impl MockReconnector {
    pub fn always_failing() -> Self {
        Self::default()
    }

    pub fn succeeding_on(attempt: usize) -> Self {
        Self {
            succeed_on: Some(attempt),
            ..Default::default()
        }
    }

    /// Every attempt returns Ok but the transport never opens
    pub fn reporting_closed() -> Self {
        Self {
            succeed_on: Some(1),
            report_closed: true,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each attempt was made
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times
            .lock()
            .map(|times| times.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Reconnector for MockReconnector {
    async fn reconnect(&mut self) -> Result<(), String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut times) = self.attempt_times.lock() {
            times.push(Instant::now());
        }

        match self.succeed_on {
            Some(n) if attempt >= n => {
                self.open = !self.report_closed;
                Ok(())
            }
            _ => {
                self.open = false;
                Err(format!("mock reconnect failure #{attempt}"))
            }
        }
    }

    fn is_connection_open(&self) -> bool {
        self.open
    }
}
