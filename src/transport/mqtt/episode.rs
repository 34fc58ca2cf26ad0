//! Async executor for reconnect episodes
//!
//! Drives [`ReconnectPolicy`] over a [`Reconnector`]: sleeps the backoff
//! delays, makes the attempts, publishes every state change and raises the
//! exit flag when the budget is spent.

use super::connection::{ConnectionState, LifecycleEvent, ReconnectConfig};
use super::reconnect::{LinkAction, LinkEvent, ReconnectPolicy, Transition};
use crate::exit::ExitFlag;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn, Instrument};

/// Something that can re-establish the broker connection
#[async_trait]
pub trait Reconnector: Send {
    /// Make one reconnect attempt
    async fn reconnect(&mut self) -> Result<(), String>;

    /// Whether the transport is open after the last attempt
    fn is_connection_open(&self) -> bool;
}

/// How a reconnect episode ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeOutcome {
    /// Connection restored on attempt number `attempts`
    Reconnected { attempts: u32 },
    /// Every attempt failed and the exit flag was raised
    Exhausted { attempts: u32 },
    /// The current state does not start an episode
    NotStarted,
    /// Shutdown was requested during a backoff delay
    Cancelled,
}

/// Run one reconnect episode triggered by a connection loss.
///
/// Returns as soon as an attempt succeeds; never makes more than
/// `config.max_attempts` attempts.
#[allow(clippy::too_many_arguments)]
pub async fn run_reconnect_episode<R>(
    reconnector: &mut R,
    config: &ReconnectConfig,
    cause: String,
    state_tx: &watch::Sender<ConnectionState>,
    exit: &ExitFlag,
    mut shutdown_rx: watch::Receiver<bool>,
    lifecycle: Option<&broadcast::Sender<LifecycleEvent>>,
) -> EpisodeOutcome
where
    R: Reconnector + ?Sized,
{
    let span = crate::lifecycle_span!(operation = "reconnect_episode", cause = %cause);

    async move {
        let mut state = state_tx.borrow().clone();
        let mut transition = ReconnectPolicy::transition(
            config,
            &state,
            LinkEvent::ConnectionLost(cause.clone()),
        );
        apply(state_tx, &mut state, &transition);

        if !matches!(transition.actions.first(), Some(LinkAction::Attempt { .. })) {
            return EpisodeOutcome::NotStarted;
        }

        warn!("Connection lost: {}, trying to reconnect", cause);
        notify(lifecycle, LifecycleEvent::ConnectionLost { reason: cause });

        let mut attempts = 0;
        loop {
            let Some(action) = transition.actions.first().cloned() else {
                return EpisodeOutcome::NotStarted;
            };

            match action {
                LinkAction::Attempt { attempt, delay } => {
                    attempts = attempt;
                    notify(lifecycle, LifecycleEvent::Reconnecting { attempt, delay });
                    info!(
                        "Reconnecting in {}s (attempt {}/{})",
                        delay.as_secs(),
                        attempt,
                        config.max_attempts
                    );

                    if !interruptible_sleep(&mut shutdown_rx, delay).await {
                        return EpisodeOutcome::Cancelled;
                    }

                    let event = match reconnector.reconnect().await {
                        Ok(()) if reconnector.is_connection_open() => LinkEvent::HandshakeComplete,
                        Ok(()) => {
                            LinkEvent::AttemptFailed("transport still closed after reconnect".into())
                        }
                        Err(reason) => LinkEvent::AttemptFailed(reason),
                    };
                    if let LinkEvent::AttemptFailed(reason) = &event {
                        warn!("Failed to reconnect (attempt {}): {}", attempt, reason);
                    }

                    let failed = matches!(event, LinkEvent::AttemptFailed(_));
                    transition = ReconnectPolicy::transition(config, &state, event);
                    apply(state_tx, &mut state, &transition);

                    if failed
                        && matches!(transition.actions.first(), Some(LinkAction::Attempt { .. }))
                    {
                        info!("Reconnect failed, waiting for the next reconnection");
                    }
                }
                LinkAction::Subscribe => {
                    notify(lifecycle, LifecycleEvent::Connected { reconnected: true });
                    return EpisodeOutcome::Reconnected { attempts };
                }
                LinkAction::RaiseExitFlag => {
                    exit.raise();
                    notify(lifecycle, LifecycleEvent::Exhausted { attempts });
                    return EpisodeOutcome::Exhausted { attempts };
                }
            }
        }
    }
    .instrument(span)
    .await
}

fn apply(
    state_tx: &watch::Sender<ConnectionState>,
    state: &mut ConnectionState,
    transition: &Transition,
) {
    ReconnectPolicy::log_state_transition(state, &transition.state);
    *state = transition.state.clone();
    state_tx.send_replace(transition.state.clone());
}

fn notify(lifecycle: Option<&broadcast::Sender<LifecycleEvent>>, event: LifecycleEvent) {
    if let Some(tx) = lifecycle {
        // No receivers is fine
        let _ = tx.send(event);
    }
}

/// Sleep for `delay` unless shutdown is requested first.
/// Returns true if the sleep completed, false if shutdown was requested.
pub async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnect delay, stopping");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockReconnector;

    fn connected_state() -> (watch::Sender<ConnectionState>, watch::Receiver<ConnectionState>) {
        watch::channel(ConnectionState::Connected)
    }

    #[tokio::test(start_paused = true)]
    async fn test_episode_not_started_from_reconnecting() {
        // Arrange
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(2),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reconnector = MockReconnector::always_failing();
        let exit = ExitFlag::new();

        // Act
        let outcome = run_reconnect_episode(
            &mut reconnector,
            &ReconnectConfig::default(),
            "reset".to_string(),
            &state_tx,
            &exit,
            shutdown_rx,
            None,
        )
        .await;

        // Assert
        assert_eq!(outcome, EpisodeOutcome::NotStarted);
        assert_eq!(reconnector.attempts(), 0);
        assert!(!exit.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_episode_publishes_states() {
        // Arrange
        let (state_tx, state_rx) = connected_state();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reconnector = MockReconnector::succeeding_on(2);
        let exit = ExitFlag::new();
        let (lifecycle_tx, mut lifecycle_rx) = broadcast::channel(16);

        // Act
        let outcome = run_reconnect_episode(
            &mut reconnector,
            &ReconnectConfig::default(),
            "reset".to_string(),
            &state_tx,
            &exit,
            shutdown_rx,
            Some(&lifecycle_tx),
        )
        .await;

        // Assert
        assert_eq!(outcome, EpisodeOutcome::Reconnected { attempts: 2 });
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        let mut events = Vec::new();
        while let Ok(event) = lifecycle_rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                LifecycleEvent::ConnectionLost {
                    reason: "reset".to_string()
                },
                LifecycleEvent::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                },
                LifecycleEvent::Reconnecting {
                    attempt: 2,
                    delay: Duration::from_secs(2)
                },
                LifecycleEvent::Connected { reconnected: true },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_episode() {
        // Arrange
        let (state_tx, _state_rx) = connected_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut reconnector = MockReconnector::always_failing();
        let exit = ExitFlag::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let _ = shutdown_tx.send(true);
        });

        // Act
        let outcome = run_reconnect_episode(
            &mut reconnector,
            &ReconnectConfig::default(),
            "reset".to_string(),
            &state_tx,
            &exit,
            shutdown_rx,
            None,
        )
        .await;

        // Assert: attempt 1 ran at 1s, shutdown landed during the 2s delay
        assert_eq!(outcome, EpisodeOutcome::Cancelled);
        assert_eq!(reconnector.attempts(), 1);
        assert!(!exit.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut shutdown_rx, Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_already_shut_down() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(true);
        assert!(!interruptible_sleep(&mut shutdown_rx, Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_interrupted() {
        // Arrange
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        // Act
        let start = tokio::time::Instant::now();
        let completed = interruptible_sleep(&mut shutdown_rx, Duration::from_secs(60)).await;

        // Assert
        assert!(!completed, "Sleep should be interrupted by shutdown signal");
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
