//! Pure message routing and subscription bookkeeping for MQTT events
//!
//! [`MessageHandler`] turns raw rumqttc events into routing decisions.
//! [`SubscriptionRegistry`] keeps the per-filter callbacks and matches
//! SUBACKs to the subscribe calls waiting on them.

use super::connection::MqttError;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Callback invoked for every message matching a subscription filter
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Outcome of a SUBACK for one filter
pub type SubscribeAck = Result<QoS, MqttError>;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    accepted: connack.code == ConnectReturnCode::Success,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    pkid: suback.pkid,
                    granted: Self::validate_subscription_success(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent { pkid: *pkid },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function).
    ///
    /// Every subscribe carries one filter, so the first code decides.
    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> Result<QoS, String> {
        match return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
            Some(SubscribeReasonCode::Failure) => Err("broker rejected subscription".to_string()),
            None => Err("SUBACK carried no return codes".to_string()),
        }
    }
}

/// Check whether `topic` matches the subscription `filter` (MQTT 3.1.1 rules).
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it. Wildcards in the first level never match topics
/// starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// CONNACK received; `accepted` is false when the broker refused
    ConnectionAcknowledged { accepted: bool },
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// SUBACK for the subscribe with packet id `pkid`
    SubscriptionAcknowledged {
        pkid: u16,
        granted: Result<QoS, String>,
    },
    /// SUBSCRIBE written to the network with packet id `pkid`
    SubscribeSent { pkid: u16 },
    /// MQTT broker disconnected
    Disconnected,
    /// Our own DISCONNECT went out; the session is over
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Ticket identifying a queued subscribe acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckTicket(u64);

struct PendingAck {
    ticket: AckTicket,
    filter: String,
    tx: oneshot::Sender<SubscribeAck>,
}

/// Callbacks per topic filter plus the subscribe calls awaiting a SUBACK.
///
/// rumqttc assigns packet ids inside the event loop, so a pending ack is
/// queued before the request is handed over and bound to its packet id when
/// the matching `Outgoing::Subscribe` is observed. Requests leave the client
/// in order, so a FIFO is enough to pair them up.
#[derive(Default)]
pub struct SubscriptionRegistry {
    callbacks: HashMap<String, MessageCallback>,
    queued: VecDeque<PendingAck>,
    in_flight: HashMap<u16, PendingAck>,
    next_ticket: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `filter`, replacing any earlier one.
    /// Returns `true` when an earlier callback was replaced.
    pub fn register(&mut self, filter: &str, callback: MessageCallback) -> bool {
        self.callbacks.insert(filter.to_string(), callback).is_some()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Queue an acknowledgement for a subscribe about to be sent
    pub fn queue_ack(&mut self, filter: &str) -> (AckTicket, oneshot::Receiver<SubscribeAck>) {
        let (tx, rx) = oneshot::channel();
        let ticket = AckTicket(self.next_ticket);
        self.next_ticket += 1;
        self.queued.push_back(PendingAck {
            ticket,
            filter: filter.to_string(),
            tx,
        });
        (ticket, rx)
    }

    /// Drop a queued acknowledgement whose request never reached the client
    pub fn cancel(&mut self, ticket: AckTicket) {
        self.queued.retain(|pending| pending.ticket != ticket);
    }

    /// Bind the oldest queued acknowledgement to the packet id just sent
    pub fn on_subscribe_sent(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(pending) => {
                debug!("SUBSCRIBE {} sent for {}", pkid, pending.filter);
                self.in_flight.insert(pkid, pending);
            }
            None => debug!("SUBSCRIBE {} sent with nobody waiting on it", pkid),
        }
    }

    /// Resolve the subscribe waiting on `pkid`
    pub fn on_suback(&mut self, pkid: u16, granted: Result<QoS, String>) {
        let Some(pending) = self.in_flight.remove(&pkid) else {
            debug!("Ignoring SUBACK {} with no pending subscribe", pkid);
            return;
        };

        let result = granted.map_err(|reason| {
            debug!("Subscription to {} rejected: {}", pending.filter, reason);
            MqttError::SubscriptionRejected {
                topic: pending.filter.clone(),
            }
        });
        // The subscriber may have timed out and gone away
        let _ = pending.tx.send(result);
    }

    /// Fail every pending acknowledgement, e.g. after the connection dropped
    pub fn fail_pending(&mut self, reason: &str) {
        let pending = self
            .queued
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, pending)| pending));
        for ack in pending {
            let _ = ack
                .tx
                .send(Err(MqttError::ConnectionFailedStr(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Hand a message to every matching callback. Returns how many ran.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let mut delivered = 0;
        for (filter, callback) in &self.callbacks {
            if topic_matches(filter, &message.topic) {
                callback(message);
                delivered += 1;
            }
        }
        if delivered == 0 {
            warn!("Received message on {} with no matching subscription", message.topic);
        }
        delivered
    }
}
