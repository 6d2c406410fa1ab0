//! Broker connection lifecycle.
//!
//! [`TransportSession`] owns the single MQTT link of the process. The
//! connection state lives in a `watch` channel so readers never block, and the
//! link slot is only locked for short bookkeeping, never across network I/O.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──CONNACK──► Connected
//!      ▲                         │                      │
//!      └──── retries exhausted ──┘        disconnect / broker drop
//!      ▲                                                │
//!      └────────────── Disconnecting ◄──────────────────┘
//! ```
//!
//! The handshake itself is a small typestate machine (`Dialing → Subscribing →
//! Established`) so the event loop can only be handed off once the broker has
//! acknowledged the session and subscriptions are queued.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use statum::{machine, state};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttSettings;
use super::message_manager::InboundMessage;
use super::SUBSCRIBED_TOPICS;
use crate::status::StatusMessage;

const REQUEST_CAPACITY: usize = 10;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Connection change already in progress ({0:?})")]
    Busy(ConnectionState),

    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("No CONNACK from broker within {0:?}")]
    Timeout(Duration),
}

impl From<ConnectionError> for ConnectError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionRefused(code) => ConnectError::Refused(format!("{:?}", code)),
            other => ConnectError::Unreachable(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DisconnectError {
    #[error("Connection change already in progress ({0:?})")]
    Busy(ConnectionState),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("MQTT client not connected")]
    NotConnected,

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport failure: {0}")]
    TransportFailure(String),
}

/// Outbound seam used by the publish scheduler.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[state]
#[derive(Debug, Clone)]
pub enum HandshakeState {
    Dialing,
    Subscribing,
    Established,
}

#[machine]
struct Handshake<S: HandshakeState> {
    client: AsyncClient,
    event_loop: EventLoop,
    qos: QoS,
    io_timeout: Duration,
}

impl Handshake<Dialing> {
    fn open(settings: &MqttSettings, host: &str, port: u16) -> Self {
        let mut options = MqttOptions::new(settings.client_id(), host, port);
        options
            .set_keep_alive(settings.keep_alive())
            .set_clean_session(true);
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(user.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self::new(client, event_loop, settings.qos(), settings.io_timeout())
    }

    async fn await_connack(mut self) -> Result<Handshake<Subscribing>, ConnectError> {
        let limit = self.io_timeout;
        let acknowledged = timeout(limit, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(other) => debug!("Handshake event: {:?}", other),
                    Err(e) => return Err(ConnectError::from(e)),
                }
            }
        })
        .await;

        match acknowledged {
            Ok(Ok(())) => {
                debug!("CONNACK received");
                Ok(self.transition())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Timeout(limit)),
        }
    }
}

impl Handshake<Subscribing> {
    async fn subscribe(self, topics: &[&str]) -> Result<Handshake<Established>, ConnectError> {
        for topic in topics {
            self.client
                .subscribe(*topic, self.qos)
                .await
                .map_err(|e| ConnectError::Unreachable(format!("Subscribe to {} failed: {}", topic, e)))?;
            debug!("Subscription to {} queued", topic);
        }
        Ok(self.transition())
    }
}

impl Handshake<Established> {
    fn into_parts(self) -> (AsyncClient, EventLoop) {
        (self.client, self.event_loop)
    }
}

struct Link {
    client: AsyncClient,
    cancel: CancellationToken,
    event_task: JoinHandle<()>,
}

impl Link {
    fn discard(self) {
        self.cancel.cancel();
        self.event_task.abort();
    }
}

pub struct TransportSession {
    settings: MqttSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Mutex<Option<Link>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl TransportSession {
    /// Inbound messages are forwarded, in arrival order, into `inbound`.
    pub fn new(settings: MqttSettings, inbound: mpsc::Sender<InboundMessage>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            state: Arc::new(state),
            link: Mutex::new(None),
            inbound,
        }
    }

    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<StatusMessage, ConnectError> {
        let mut observed = ConnectionState::Disconnected;
        let claimed = self.state.send_if_modified(|state| {
            observed = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match observed {
                ConnectionState::Connected => {
                    debug!("Connect requested while already connected");
                    Ok(StatusMessage::AlreadyConnected)
                }
                busy => Err(ConnectError::Busy(busy)),
            };
        }

        // A broker-dropped session leaves its dead link behind
        self.discard_link().await;

        let broker = format!("{}:{}", host, port);
        info!("Connecting to MQTT broker at {}", broker);

        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = ConnectError::Unreachable(format!("No attempt made for {}", broker));
        for attempt in 1..=attempts {
            match self.handshake(host, port).await {
                Ok((client, event_loop)) => {
                    self.install_link(client, event_loop).await;
                    info!("MQTT client connected to {}", broker);
                    return Ok(StatusMessage::Connected { broker });
                }
                Err(ConnectError::Refused(reason)) => {
                    error!("Broker {} refused the connection: {}", broker, reason);
                    last_error = ConnectError::Refused(reason);
                    break;
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} to {} failed: {}", attempt, attempts, broker, e);
                    last_error = e;
                    if attempt < attempts {
                        let delay = self.settings.backoff_after(attempt);
                        debug!("Retrying in {:?}", delay);
                        sleep(delay).await;
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        Err(last_error)
    }

    async fn handshake(&self, host: &str, port: u16) -> Result<(AsyncClient, EventLoop), ConnectError> {
        let established = Handshake::<Dialing>::open(&self.settings, host, port)
            .await_connack()
            .await?
            .subscribe(&SUBSCRIBED_TOPICS)
            .await?;
        Ok(established.into_parts())
    }

    async fn install_link(&self, client: AsyncClient, event_loop: EventLoop) {
        let mut slot = self.link.lock().await;
        // Connected must be visible before the loop can report a drop
        self.state.send_replace(ConnectionState::Connected);

        let cancel = CancellationToken::new();
        let event_task = tokio::spawn(pump_events(
            event_loop,
            self.state.clone(),
            self.inbound.clone(),
            cancel.clone(),
        ));
        *slot = Some(Link {
            client,
            cancel,
            event_task,
        });
    }

    async fn discard_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            debug!("Discarding stale MQTT link");
            link.discard();
        }
    }

    /// Tears the link down. Teardown problems are logged; the session always
    /// ends up Disconnected.
    pub async fn disconnect(&self) -> Result<StatusMessage, DisconnectError> {
        let mut observed = ConnectionState::Disconnected;
        let claimed = self.state.send_if_modified(|state| {
            observed = *state;
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match observed {
                ConnectionState::Disconnected => {
                    self.discard_link().await;
                    Ok(StatusMessage::AlreadyDisconnected)
                }
                busy => Err(DisconnectError::Busy(busy)),
            };
        }

        info!("Disconnecting from MQTT broker");
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.teardown(link).await;
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("MQTT client disconnected");
        Ok(StatusMessage::Disconnected)
    }

    async fn teardown(&self, link: Link) {
        let deadline = Instant::now() + self.settings.io_timeout();
        let Link {
            client,
            cancel,
            event_task,
        } = link;

        let farewell = async {
            for topic in SUBSCRIBED_TOPICS {
                client.unsubscribe(topic).await?;
            }
            client.disconnect().await
        };
        finish_link(deadline, farewell, event_task).await;
        cancel.cancel();
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.status() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        let client = match self.link.lock().await.as_ref() {
            Some(link) => link.client.clone(),
            None => return Err(PublishError::NotConnected),
        };

        let size = payload.len();
        timeout(
            self.settings.io_timeout(),
            client.publish(topic, self.settings.qos(), false, payload),
        )
        .await
        .map_err(|_| PublishError::TransportFailure(format!("Publish to {} timed out", topic)))?
        .map_err(|e| PublishError::TransportFailure(e.to_string()))?;

        debug!("Published {} bytes to {}", size, topic);
        Ok(())
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload).await
    }
}

#[async_trait]
impl Publisher for TransportSession {
    fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Connected
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        TransportSession::publish(self, topic, payload).await
    }
}

/// Queues the farewell packets and lets the event loop flush them. Both
/// phases share `deadline`; a loop still running then is aborted.
async fn finish_link<E: fmt::Display>(
    deadline: Instant,
    farewell: impl Future<Output = Result<(), E>>,
    mut event_task: JoinHandle<()>,
) {
    match timeout_at(deadline, farewell).await {
        Ok(Ok(())) => debug!("Unsubscribe and DISCONNECT queued"),
        Ok(Err(e)) => warn!("MQTT teardown error: {}", e),
        Err(_) => warn!("MQTT teardown timed out before DISCONNECT was queued"),
    }

    if timeout_at(deadline, &mut event_task).await.is_err() {
        warn!("MQTT event loop did not stop in time, aborting it");
        event_task.abort();
    }
}

fn mark_lost(state: &watch::Sender<ConnectionState>) {
    let changed = state.send_if_modified(|current| {
        if *current == ConnectionState::Connected {
            *current = ConnectionState::Disconnected;
            true
        } else {
            false
        }
    });
    if changed {
        warn!("MQTT connection lost");
    }
}

async fn pump_events(
    mut event_loop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    info!("Starting MQTT event loop");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic: {}", publish.topic);
                match InboundMessage::decode(&publish.topic, &publish.payload) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            warn!("Inbound channel closed, dropping message");
                        }
                    }
                    Err(e) => warn!("Dropping inbound message: {}", e),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => debug!("Subscription confirmed"),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                mark_lost(&state);
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                mark_lost(&state);
                break;
            }
        }
    }
    info!("MQTT event loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::inbound_channel;
    use crate::mqtt::SENSOR_DATA_TOPIC;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    fn quick_settings() -> MqttSettings {
        MqttSettings {
            client_id: "weatherlink-test".to_string(),
            connect_attempts: 2,
            connect_backoff_ms: 10,
            io_timeout_secs: 2,
            ..MqttSettings::default()
        }
    }

    /// Accepts one client, answers its CONNECT and hands the socket back.
    async fn fake_broker() -> (u16, oneshot::Receiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&CONNACK).await.unwrap();
            let _ = tx.send(socket);
        });
        (port, rx)
    }

    /// Counts every handshake; each client gets `reply` (if any) and is then
    /// hung up on.
    async fn counting_broker(reply: Option<[u8; 4]>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 512];
                let _ = socket.read(&mut buf).await;
                if let Some(reply) = reply {
                    let _ = socket.write_all(&reply).await;
                }
            }
        });
        (port, accepted)
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x30, remaining as u8, 0x00, topic.len() as u8];
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    #[tokio::test]
    async fn disconnect_when_disconnected_is_a_noop() {
        let (tx, _rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);

        let status = session.disconnect().await.unwrap();

        assert_eq!(status, StatusMessage::AlreadyDisconnected);
        assert_eq!(session.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let (tx, _rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);

        let err = session.publish("weather/data", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    #[tokio::test]
    async fn connect_while_connecting_reports_busy() {
        let (tx, _rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);
        session.state.send_replace(ConnectionState::Connecting);

        let err = session.connect("127.0.0.1", 1883).await.unwrap_err();
        assert!(matches!(err, ConnectError::Busy(ConnectionState::Connecting)));

        let err = session.disconnect().await.unwrap_err();
        assert!(matches!(err, DisconnectError::Busy(ConnectionState::Connecting)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_after_retries() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, _rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);

        let err = session.connect("127.0.0.1", port).await.unwrap_err();

        assert!(matches!(err, ConnectError::Unreachable(_)));
        assert_eq!(session.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_forwards_inbound_and_notices_broker_drop() {
        let (port, socket) = fake_broker().await;
        let (tx, mut rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);

        let status = session.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(
            status,
            StatusMessage::Connected {
                broker: format!("127.0.0.1:{}", port)
            }
        );
        assert_eq!(session.status(), ConnectionState::Connected);
        assert_eq!(
            session.connect("127.0.0.1", port).await.unwrap(),
            StatusMessage::AlreadyConnected
        );

        let mut socket = socket.await.unwrap();
        let reading = br#"{"temperature":23.5,"humidity":55.0,"pressure":1012.0}"#;
        socket
            .write_all(&publish_packet(SENSOR_DATA_TOPIC, reading))
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match message {
            InboundMessage::SensorReading(reading) => assert_eq!(reading.temperature, 23.5),
            other => panic!("unexpected message: {other}"),
        }

        drop(socket);
        let mut watcher = session.watch_status();
        timeout(
            Duration::from_secs(2),
            watcher.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        let err = session.publish("weather/data", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_tears_down_live_link() {
        let (port, socket) = fake_broker().await;
        let (tx, _rx) = inbound_channel(8);
        let session = TransportSession::new(quick_settings(), tx);
        session.connect("127.0.0.1", port).await.unwrap();
        let _socket = socket.await.unwrap();

        let status = session.disconnect().await.unwrap();

        assert_eq!(status, StatusMessage::Disconnected);
        assert_eq!(session.status(), ConnectionState::Disconnected);
        assert!(session.link.lock().await.is_none());
    }

    #[tokio::test]
    async fn dropped_handshakes_are_retried_up_to_the_limit() {
        let (port, accepted) = counting_broker(None).await;
        let (tx, _rx) = inbound_channel(8);
        let settings = MqttSettings {
            connect_attempts: 3,
            ..quick_settings()
        };
        let session = TransportSession::new(settings, tx);

        let err = session.connect("127.0.0.1", port).await.unwrap_err();

        assert!(matches!(err, ConnectError::Unreachable(_)));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(session.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_credentials_are_not_retried() {
        let (port, accepted) = counting_broker(Some(CONNACK_NOT_AUTHORIZED)).await;
        let (tx, _rx) = inbound_channel(8);
        let settings = MqttSettings {
            connect_attempts: 3,
            ..quick_settings()
        };
        let session = TransportSession::new(settings, tx);

        let err = session.connect("127.0.0.1", port).await.unwrap_err();

        assert!(matches!(err, ConnectError::Refused(_)));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_phases_share_one_deadline() {
        let limit = Duration::from_secs(10);
        let started = Instant::now();
        let stuck_loop = tokio::spawn(std::future::pending::<()>());
        let stuck_farewell = std::future::pending::<Result<(), std::io::Error>>();

        finish_link(started + limit, stuck_farewell, stuck_loop).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= limit);
        assert!(elapsed < limit + Duration::from_secs(1), "took {elapsed:?}");
    }
}
