//! Impure I/O operations for MQTT client
//!
//! Owns the rumqttc event loop on a background task, publishes connection
//! state over a `watch` channel and lifecycle events over a `broadcast`
//! channel, and runs reconnect episodes inline when the link drops.

use super::connection::{
    configure_mqtt_options, ConnectionState, LifecycleEvent, MqttError, ReconnectConfig,
};
use super::episode::{run_reconnect_episode, EpisodeOutcome, Reconnector};
use super::message_handler::{
    EventRoute, MessageCallback, MessageHandler, SubscriptionRegistry,
};
use super::reconnect::{LinkAction, LinkEvent, ReconnectPolicy};
use crate::config::ClientConfig;
use crate::exit::ExitFlag;
use crate::tls::SecurityContext;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS, Request,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const LIFECYCLE_CHANNEL_CAPACITY: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// MQTT client with TLS transport and bounded reconnect
pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    broker: String,
    connect_timeout: Duration,
    reconnect_config: ReconnectConfig,
    exit: ExitFlag,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(
        config: &ClientConfig,
        security: SecurityContext,
        exit: ExitFlag,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(config, security)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let ((state_tx, state_rx), (shutdown_tx, _)) = Self::setup_connection_channels();
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        Ok(MqttClient {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            broker: config.broker_uri(),
            connect_timeout: config.connect_timeout(),
            reconnect_config: config.reconnect_config(),
            exit,
            state_tx,
            state_rx,
            shutdown_tx,
            lifecycle_tx,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
            event_loop_handle: Mutex::new(None),
        })
    }

    /// Override the bound on the initial CONNACK wait and each reconnect attempt
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the backoff used by reconnect episodes
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Observe connection lifecycle events. Subscribe before `connect()` to
    /// see the initial handshake.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Wait for the first CONNACK with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        broker: &str,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                {
                    let state = state_rx.borrow_and_update();
                    match &*state {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Failed(reason) => {
                            return Err(MqttError::ConnectionFailedStr(reason.clone()));
                        }
                        _ => {}
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        confirmation.unwrap_or_else(|_| {
            Err(MqttError::ConnectTimeout {
                broker: broker.to_string(),
                timeout,
            })
        })
    }

    /// Connect to the broker and wait for the CONNACK.
    ///
    /// The initial connect is never retried: a refusal, transport error or
    /// timeout leaves the client in [`ConnectionState::Failed`].
    pub async fn connect(&self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.lock().await.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        info!("Connecting to MQTT broker at {}", self.broker);

        let driver = ConnectionDriver {
            event_loop,
            connect_timeout: self.connect_timeout,
            reconnect_config: self.reconnect_config.clone(),
            exit: self.exit.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            lifecycle_tx: self.lifecycle_tx.clone(),
            registry: self.registry.clone(),
        };
        *self.event_loop_handle.lock().await = Some(tokio::spawn(driver.run()));

        let result = Self::wait_for_connection_confirmation(
            self.state_rx.clone(),
            &self.broker,
            self.connect_timeout,
        )
        .await;

        if let Err(e) = &result {
            let current = self.connection_state();
            if !matches!(current, ConnectionState::Failed(_)) {
                let failed = ConnectionState::Failed(e.to_string());
                ReconnectPolicy::log_state_transition(&current, &failed);
                self.state_tx.send_replace(failed);
            }
            let _ = self.shutdown_tx.send(true);
            if let Some(handle) = self.event_loop_handle.lock().await.take() {
                handle.abort();
            }
        }

        result
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// True only while a handshake is complete and the link is up
    pub fn is_connection_open(&self) -> bool {
        self.state_rx.borrow().is_open()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if !ReconnectPolicy::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Publish a message. Requires an open connection.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    /// Subscribe to `topic` and resolve with the granted QoS once the SUBACK
    /// arrives. The callback replaces any earlier one for the same filter.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<QoS, MqttError> {
        let current_state = self.connection_state();
        if !ReconnectPolicy::can_subscribe(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        let ack_rx = {
            let mut registry = self.registry.lock().await;
            if registry.register(topic, callback) {
                debug!("Replaced message callback for {}", topic);
            }

            // Queue and send under the lock so acks pair up with requests in order
            let (ticket, ack_rx) = registry.queue_ack(topic);
            if let Err(e) = self.client.try_subscribe(topic, qos) {
                registry.cancel(ticket);
                return Err(MqttError::SubscriptionFailed(Box::new(e)));
            }
            ack_rx
        };

        debug!("Subscribe request for {} queued", topic);
        ack_rx.await.unwrap_or_else(|_| {
            Err(MqttError::ConnectionFailedStr(
                "Event loop stopped before the subscription was acknowledged".to_string(),
            ))
        })
    }

    /// Disconnect from the broker.
    ///
    /// Sends DISCONNECT when the link is up, then gives the event loop task a
    /// short grace period before aborting it.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let Some(mut handle) = self.event_loop_handle.lock().await.take() else {
            return Ok(());
        };

        if self.is_connection_open() {
            // Closed for good: a link error after this must not start an episode
            self.state_tx
                .send_replace(ConnectionState::Failed("client disconnected".to_string()));
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue DISCONNECT: {}", e);
                let _ = self.shutdown_tx.send(true);
            }
        } else {
            let _ = self.shutdown_tx.send(true);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }
        let _ = self.shutdown_tx.send(true);

        info!("MQTT client disconnected");
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, qos, retain, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<QoS, Self::Error> {
        MqttClient::subscribe(self, topic, qos, callback).await
    }

    fn is_connection_open(&self) -> bool {
        MqttClient::is_connection_open(self)
    }

    fn connection_state(&self) -> ConnectionState {
        MqttClient::connection_state(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No async work in Drop; call disconnect() for a clean shutdown
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Background task that owns the event loop
struct ConnectionDriver {
    event_loop: EventLoop,
    connect_timeout: Duration,
    reconnect_config: ReconnectConfig,
    exit: ExitFlag,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        debug!("MQTT event loop started");

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                    continue;
                }
                polled = self.event_loop.poll() => polled,
            };

            let keep_running = match polled {
                Ok(event) => self.handle_event(event).await,
                Err(e) => self.handle_connection_error(e).await,
            };
            if !keep_running {
                break;
            }
        }

        debug!("MQTT event loop stopped");
    }

    /// Returns false when the loop should stop
    async fn handle_event(&mut self, event: Event) -> bool {
        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged { accepted: true } => {
                self.on_handshake();
                true
            }
            EventRoute::ConnectionAcknowledged { accepted: false } => {
                // rumqttc reports refusals as errors from the next poll
                debug!("Broker refused the connection");
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);
                self.registry.lock().await.dispatch(&message);
                true
            }
            EventRoute::SubscriptionAcknowledged { pkid, granted } => {
                self.registry.lock().await.on_suback(pkid, granted);
                true
            }
            EventRoute::SubscribeSent { pkid } => {
                self.registry.lock().await.on_subscribe_sent(pkid);
                true
            }
            EventRoute::Disconnected => {
                warn!("Broker sent DISCONNECT");
                true
            }
            EventRoute::DisconnectSent => {
                debug!("DISCONNECT sent, stopping event loop");
                self.registry.lock().await.fail_pending("client disconnected");
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn on_handshake(&self) {
        let current = self.state_tx.borrow().clone();
        let transition =
            ReconnectPolicy::transition(&self.reconnect_config, &current, LinkEvent::HandshakeComplete);
        ReconnectPolicy::log_state_transition(&current, &transition.state);
        self.state_tx.send_replace(transition.state);

        if transition.actions.contains(&LinkAction::Subscribe) {
            let _ = self
                .lifecycle_tx
                .send(LifecycleEvent::Connected { reconnected: false });
        }
    }

    /// Returns false when the loop should stop
    async fn handle_connection_error(&mut self, e: ConnectionError) -> bool {
        let reason = e.to_string();
        self.registry.lock().await.fail_pending(&reason);

        if *self.shutdown_rx.borrow() {
            return false;
        }

        let current = self.state_tx.borrow().clone();
        match current {
            ConnectionState::Connecting => {
                let transition = ReconnectPolicy::transition(
                    &self.reconnect_config,
                    &current,
                    LinkEvent::ConnectionLost(reason),
                );
                ReconnectPolicy::log_state_transition(&current, &transition.state);
                self.state_tx.send_replace(transition.state);
                false
            }
            ConnectionState::Connected => {
                let mut reconnector = EventLoopReconnector {
                    event_loop: &mut self.event_loop,
                    timeout: self.connect_timeout,
                    open: false,
                };
                let outcome = run_reconnect_episode(
                    &mut reconnector,
                    &self.reconnect_config,
                    reason,
                    &self.state_tx,
                    &self.exit,
                    self.shutdown_rx.clone(),
                    Some(&self.lifecycle_tx),
                )
                .await;

                match outcome {
                    EpisodeOutcome::Reconnected { attempts } => {
                        debug!("Reconnect episode finished after {} attempt(s)", attempts);
                        true
                    }
                    EpisodeOutcome::Exhausted { .. } => {
                        error!("Giving up on the broker, event loop stopped");
                        false
                    }
                    EpisodeOutcome::NotStarted | EpisodeOutcome::Cancelled => false,
                }
            }
            other => {
                debug!("Ignoring connection error in state {:?}: {}", other, reason);
                false
            }
        }
    }
}

/// Drop publishes and subscribes that rumqttc parked for replay after a
/// connection loss. Timestamps are not backlogged and subscribes are reissued
/// by the handshake hook.
fn discard_stale_requests(pending: &mut VecDeque<Request>) -> usize {
    let before = pending.len();
    pending.retain(|request| !matches!(request, Request::Publish(_) | Request::Subscribe(_)));
    before - pending.len()
}

/// Reconnects by polling the existing event loop, which redials after an error
struct EventLoopReconnector<'a> {
    event_loop: &'a mut EventLoop,
    timeout: Duration,
    open: bool,
}

#[async_trait]
impl<'a> Reconnector for EventLoopReconnector<'a> {
    async fn reconnect(&mut self) -> Result<(), String> {
        self.open = false;
        let dropped = discard_stale_requests(&mut self.event_loop.pending);
        if dropped > 0 {
            debug!("Dropped {} request(s) queued before the connection was lost", dropped);
        }
        let event_loop = &mut *self.event_loop;

        let attempt = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        return if connack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(format!("connection refused: {:?}", connack.code))
                        };
                    }
                    Ok(other) => debug!("Skipping {:?} while reconnecting", other),
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => {
                self.open = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!("no CONNACK within {:?}", self.timeout)),
        }
    }

    fn is_connection_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{PingReq, Publish, Subscribe};
    use tokio::time::Duration;

    fn test_client() -> MqttClient {
        let ca = include_bytes!("../../../tests/fixtures/ca.pem");
        let security = SecurityContext::from_pem(Some(ca), None).unwrap();
        MqttClient::new(&ClientConfig::default(), security, ExitFlag::new()).unwrap()
    }

    #[test]
    fn test_discard_stale_requests_keeps_control_packets() {
        // Arrange: what rumqttc parks in `pending` after a drop
        let mut pending = VecDeque::from(vec![
            Request::Publish(Publish::new("golang-mqtt/test", QoS::AtMostOnce, "late")),
            Request::PingReq(PingReq),
            Request::Subscribe(Subscribe::new("golang-mqtt/test", QoS::AtMostOnce)),
            Request::Publish(Publish::new("golang-mqtt/test", QoS::AtMostOnce, "later")),
        ]);

        // Act
        let dropped = discard_stale_requests(&mut pending);

        // Assert
        assert_eq!(dropped, 3);
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending.front(), Some(Request::PingReq(_))));
    }

    #[test]
    fn test_discard_stale_requests_on_empty_queue() {
        let mut pending = VecDeque::new();
        assert_eq!(discard_stale_requests(&mut pending), 0);
    }

    #[test]
    fn test_setup_connection_channels() {
        // Act: Create channels using pure function
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        // Assert: Verify initial states
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        // Arrange: Create channels and spawn task to signal connected
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        // Act
        let result = MqttClient::wait_for_connection_confirmation(
            state_rx,
            "tls://127.0.0.1:8883",
            Duration::from_millis(500),
        )
        .await;

        // Assert
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_confirmation_timeout() {
        // Arrange: keep the sender alive but never signal
        let ((_state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        // Act
        let result = MqttClient::wait_for_connection_confirmation(
            state_rx,
            "tls://127.0.0.1:8883",
            Duration::from_secs(5),
        )
        .await;

        // Assert
        match result {
            Err(MqttError::ConnectTimeout { broker, timeout }) => {
                assert_eq!(broker, "tls://127.0.0.1:8883");
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("Expected ConnectTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_failed() {
        // Arrange
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Failed("connection refused".to_string()));
        });

        // Act
        let result = MqttClient::wait_for_connection_confirmation(
            state_rx,
            "tls://127.0.0.1:8883",
            Duration::from_millis(500),
        )
        .await;

        // Assert
        assert!(result.unwrap_err().to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let client = test_client();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);
        assert!(!client.is_connection_open());
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_fail_without_connection() {
        // Arrange
        let client = test_client();
        let callback: MessageCallback = Arc::new(|_| {});

        // Act & Assert
        assert!(matches!(
            client
                .publish("golang-mqtt/test", QoS::AtMostOnce, false, b"x".to_vec())
                .await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(matches!(
            client
                .subscribe("golang-mqtt/test", QoS::AtMostOnce, callback)
                .await,
            Err(MqttError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = test_client();
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        // Arrange: take the event loop without a broker behind it
        let mut client = test_client();
        client.event_loop.get_mut().take();

        // Act
        let result = client.connect().await;

        // Assert
        assert!(matches!(result, Err(MqttError::ConnectionFailedStr(_))));
    }
}
