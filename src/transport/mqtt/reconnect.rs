//! Pure reconnect policy for the MQTT connection
//!
//! The connection lifecycle is a function of `(state, event) -> (state,
//! actions)`. Nothing in here sleeps, polls or touches the network, so every
//! transition is testable without a broker; the async side lives in
//! [`super::episode`] and [`super::client`].

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{debug, error, info};

/// Lifecycle events fed into the policy
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// CONNACK accepted by the broker
    HandshakeComplete,
    /// Transport error or broker-side close
    ConnectionLost(String),
    /// A reconnect attempt failed or left the transport closed
    AttemptFailed(String),
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Issue the one-shot subscription for this handshake
    Subscribe,
    /// Sleep `delay`, then make reconnect attempt number `attempt`
    Attempt { attempt: u32, delay: Duration },
    /// Stop producing: the reconnect budget is spent
    RaiseExitFlag,
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    pub actions: Vec<LinkAction>,
}

impl Transition {
    fn to(state: ConnectionState, actions: Vec<LinkAction>) -> Self {
        Self { state, actions }
    }

    fn unchanged(state: &ConnectionState) -> Self {
        Self::to(state.clone(), Vec::new())
    }
}

/// Reconnect state machine
pub struct ReconnectPolicy;

impl ReconnectPolicy {
    /// Apply `event` to `state` (pure function)
    pub fn transition(
        config: &ReconnectConfig,
        state: &ConnectionState,
        event: LinkEvent,
    ) -> Transition {
        match (state, event) {
            (ConnectionState::Failed(_), _) => Transition::unchanged(state),

            (_, LinkEvent::HandshakeComplete) => {
                Transition::to(ConnectionState::Connected, vec![LinkAction::Subscribe])
            }

            // The initial connect is never retried
            (ConnectionState::Connecting, LinkEvent::ConnectionLost(reason)) => {
                Transition::to(ConnectionState::Failed(reason), Vec::new())
            }

            (
                ConnectionState::Connected | ConnectionState::Exhausted { .. },
                LinkEvent::ConnectionLost(_),
            ) => Self::start_episode(config),

            (ConnectionState::Reconnecting { attempt, delay }, LinkEvent::AttemptFailed(_)) => {
                if *attempt >= config.max_attempts {
                    Transition::to(
                        ConnectionState::Exhausted { attempts: *attempt },
                        vec![LinkAction::RaiseExitFlag],
                    )
                } else {
                    let attempt = attempt + 1;
                    let delay = config.next_delay(*delay);
                    Transition::to(
                        ConnectionState::Reconnecting { attempt, delay },
                        vec![LinkAction::Attempt { attempt, delay }],
                    )
                }
            }

            _ => Transition::unchanged(state),
        }
    }

    fn start_episode(config: &ReconnectConfig) -> Transition {
        let delay = config.delay_for_attempt(1);
        Transition::to(
            ConnectionState::Reconnecting { attempt: 1, delay },
            vec![LinkAction::Attempt { attempt: 1, delay }],
        )
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_open()
    }

    /// Check if connection state allows subscribing (pure function)
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        state.is_open()
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established successfully");
            }
            (ConnectionState::Reconnecting { attempt, .. }, ConnectionState::Connected) => {
                info!("Reconnection successful after {} attempt(s)", attempt);
            }
            (_, ConnectionState::Exhausted { attempts }) => {
                error!("Reconnect failed after {} attempts. Exiting...", attempts);
            }
            (_, ConnectionState::Failed(reason)) => {
                error!("MQTT connection failed: {}", reason);
            }
            _ if from == to => {}
            _ => {
                debug!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}
