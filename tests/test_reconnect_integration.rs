//! Integration tests for reconnecting over a real TLS link
//!
//! A minimal in-process broker speaks just enough MQTT 3.1.1 (CONNACK,
//! SUBACK, PINGRESP) over rustls with client certificate verification. It can
//! drop the live connection on demand and stops listening after a fixed number
//! of accepts, which lets the rumqttc event loop run real reconnect episodes.

use mqtt_tls_client::config::ClientConfig;
use mqtt_tls_client::exit::ExitFlag;
use mqtt_tls_client::pubsub::{log_message_callback, run_subscription_hook};
use mqtt_tls_client::tls::{IdentityPem, SecurityContext};
use mqtt_tls_client::transport::mqtt::{
    ConnectionState, LifecycleEvent, MqttClient, ReconnectConfig,
};
use rumqttc::tokio_rustls::rustls::server::WebPkiClientVerifier;
use rumqttc::tokio_rustls::rustls::{RootCertStore, ServerConfig};
use rumqttc::tokio_rustls::TlsAcceptor;
use rumqttc::QoS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};

const CA_PEM: &[u8] = include_bytes!("fixtures/ca.pem");
const CLIENT_PEM: &[u8] = include_bytes!("fixtures/client.pem");
const CLIENT_KEY: &[u8] = include_bytes!("fixtures/client.key");
const SERVER_PEM: &[u8] = include_bytes!("fixtures/server.pem");
const SERVER_KEY: &[u8] = include_bytes!("fixtures/server.key");

const TOPIC: &str = "golang-mqtt/test";

/// In-process TLS broker that serves connections one at a time
struct TlsBroker {
    port: u16,
    subscribes: Arc<AtomicUsize>,
    drop_link: Arc<Notify>,
}

impl TlsBroker {
    /// Listen on an ephemeral port and stop listening once `accepts`
    /// connections have been taken.
    async fn start(accepts: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tls_acceptor();
        let subscribes = Arc::new(AtomicUsize::new(0));
        let drop_link = Arc::new(Notify::new());

        let served = subscribes.clone();
        let kick = drop_link.clone();
        tokio::spawn(async move {
            let mut listener = Some(listener);
            for accepted in 1..=accepts {
                let Some(socket) = listener.as_ref() else { break };
                let Ok((tcp, _)) = socket.accept().await else { break };
                if accepted == accepts {
                    // Later dials are refused
                    listener = None;
                }
                let Ok(stream) = acceptor.accept(tcp).await else { continue };
                serve(stream, &served, &kick).await;
            }
        });

        Self {
            port,
            subscribes,
            drop_link,
        }
    }

    fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Close the live connection from the broker side
    fn drop_connection(&self) {
        self.drop_link.notify_one();
    }

    async fn wait_for_subscribes(&self, count: usize, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.subscribe_count() < count {
            assert!(
                Instant::now() < deadline,
                "broker saw {} SUBSCRIBE packet(s), expected {}",
                self.subscribe_count(),
                count
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut &SERVER_PEM[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &SERVER_KEY[..])
        .unwrap()
        .unwrap();

    let mut roots = RootCertStore::empty();
    for ca in rustls_pemfile::certs(&mut &CA_PEM[..]) {
        roots.add(ca.unwrap()).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .unwrap();

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn serve<S>(mut stream: S, subscribes: &AtomicUsize, drop_link: &Notify)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = drop_link.notified() => break,
            packet = read_packet(&mut stream) => packet,
        };
        let Ok((header, body)) = packet else { return };

        let reply: Option<Vec<u8>> = match header & 0xF0 {
            // CONNECT
            0x10 => Some(vec![0x20, 0x02, 0x00, 0x00]),
            // SUBSCRIBE: grant QoS 0 for the single filter
            0x80 if body.len() >= 2 => {
                subscribes.fetch_add(1, Ordering::SeqCst);
                Some(vec![0x90, 0x03, body[0], body[1], 0x00])
            }
            // PINGREQ
            0xC0 => Some(vec![0xD0, 0x00]),
            // DISCONNECT
            0xE0 => return,
            _ => None,
        };

        if let Some(reply) = reply {
            if stream.write_all(&reply).await.is_err() || stream.flush().await.is_err() {
                return;
            }
        }
    }

    let _ = stream.shutdown().await;
}

/// Read one MQTT packet: fixed header byte, remaining length, body
async fn read_packet<S>(stream: &mut S) -> std::io::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let header = stream.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; length];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn fast_backoff() -> ReconnectConfig {
    ReconnectConfig {
        first_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(400),
        max_attempts: 4,
        multiplier: 2,
    }
}

fn client_for(broker: &TlsBroker, exit: ExitFlag) -> MqttClient {
    let mut config = ClientConfig::default();
    config.mqtt.host = "127.0.0.1".to_string();
    config.mqtt.port = broker.port;
    config.mqtt.client_id = Some("reconnect-integration".to_string());

    let identity = IdentityPem {
        cert_chain: CLIENT_PEM,
        private_key: CLIENT_KEY,
    };
    let security = SecurityContext::from_pem(Some(CA_PEM), Some(identity)).unwrap();

    MqttClient::new(&config, security, exit)
        .unwrap()
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect_config(fast_backoff())
}

async fn collect_until_exhausted(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    limit: Duration,
) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    let collect = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = matches!(event, LifecycleEvent::Exhausted { .. });
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    tokio::time::timeout(limit, collect)
        .await
        .expect("reconnect episode should finish");
    seen
}

#[tokio::test]
async fn test_broker_loss_exhausts_backoff_and_raises_exit_flag() {
    // Arrange: one accepted connection, then the port is closed
    let broker = TlsBroker::start(1).await;
    let exit = ExitFlag::new();
    let client = client_for(&broker, exit.clone());
    let mut lifecycle = client.lifecycle_events();

    client.connect().await.expect("initial connect should succeed");
    let granted = tokio::time::timeout(
        Duration::from_secs(3),
        client.subscribe(TOPIC, QoS::AtMostOnce, log_message_callback()),
    )
    .await
    .expect("SUBACK within 3s")
    .expect("subscription accepted");
    assert_eq!(granted, QoS::AtMostOnce);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    // Act
    let lost_at = Instant::now();
    broker.drop_connection();
    let events = collect_until_exhausted(&mut lifecycle, Duration::from_secs(10)).await;

    // Assert: cadence 100, 200, 400, 400ms then exhaustion
    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|event| match event {
            LifecycleEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, fast_backoff().delay_sequence());
    assert!(events
        .iter()
        .any(|event| matches!(event, LifecycleEvent::ConnectionLost { .. })));
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::Exhausted { attempts: 4 })
    ));
    assert!(lost_at.elapsed() >= fast_backoff().calculate_max_total_time());

    assert!(exit.is_set());
    assert_eq!(
        client.connection_state(),
        ConnectionState::Exhausted { attempts: 4 }
    );
    assert!(!client.is_connection_open());
    assert_eq!(broker.subscribe_count(), 1);
}

#[tokio::test]
async fn test_redial_after_loss_resubscribes() {
    // Arrange: the broker accepts a second connection after dropping the first
    let broker = TlsBroker::start(2).await;
    let exit = ExitFlag::new();
    let client = Arc::new(client_for(&broker, exit.clone()));
    let mut lifecycle = client.lifecycle_events();
    let hook = tokio::spawn(run_subscription_hook(
        client.clone(),
        TOPIC.to_string(),
        client.lifecycle_events(),
        Duration::from_secs(3),
    ));

    client.connect().await.expect("initial connect should succeed");
    broker.wait_for_subscribes(1, Duration::from_secs(3)).await;

    // Act
    broker.drop_connection();
    broker.wait_for_subscribes(2, Duration::from_secs(5)).await;

    // Assert
    let mut seen = Vec::new();
    while let Ok(event) = lifecycle.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&LifecycleEvent::Connected { reconnected: false }));
    assert!(seen.contains(&LifecycleEvent::Connected { reconnected: true }));
    assert!(seen.contains(&LifecycleEvent::Reconnecting {
        attempt: 1,
        delay: Duration::from_millis(100),
    }));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(!exit.is_set());

    client.disconnect().await.unwrap();
    hook.abort();
}
