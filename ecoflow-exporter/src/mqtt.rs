//! MQTT session to the EcoFlow broker
//!
//! `ConnectionManager::connect` always builds a brand new session (TLS by default, credentials
//! from the certification exchange), waits for the CONNACK, subscribes to the quota topic and hands the
//! event loop to a background task. Broker events are dispatched to `EventHandlers`.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health::HealthTracker;
use crate::models::ConnectionParameters;
use crate::queue::ObservationQueue;
use crate::watchdog::{ConnectionState, Connector};

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Pause of the event task after an unexpected disconnect, avoids a reconnect storm.
pub const DISCONNECT_PAUSE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 10;

/// Categorized result of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Success,
    Timeout,
    UnsupportedProtocol,
    InvalidClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Other,
}

impl ConnectOutcome {
    pub fn from_error(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => (*code).into(),
            ConnectionError::NetworkTimeout => ConnectOutcome::Timeout,
            _ => ConnectOutcome::Other,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectOutcome::Success)
    }
}

impl From<ConnectReturnCode> for ConnectOutcome {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ConnectOutcome::Success,
            ConnectReturnCode::RefusedProtocolVersion => ConnectOutcome::UnsupportedProtocol,
            ConnectReturnCode::BadClientId => ConnectOutcome::InvalidClientId,
            ConnectReturnCode::ServiceUnavailable => ConnectOutcome::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ConnectOutcome::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnectOutcome::NotAuthorized,
            #[allow(unreachable_patterns)]
            _ => ConnectOutcome::Other,
        }
    }
}

impl fmt::Display for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectOutcome::Success => "connected",
            ConnectOutcome::Timeout => "connection timed out",
            ConnectOutcome::UnsupportedProtocol => "unsupported protocol version",
            ConnectOutcome::InvalidClientId => "invalid client identifier",
            ConnectOutcome::ServerUnavailable => "server unavailable",
            ConnectOutcome::BadCredentials => "bad username or password",
            ConnectOutcome::NotAuthorized => "not authorized",
            ConnectOutcome::Other => "unknown connection error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("MQTT connection refused: {0}")]
    Refused(ConnectOutcome),
    #[error("MQTT connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("MQTT subscribe failed: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// Reactions to broker events, shared by `connect` and the event task.
#[derive(Clone)]
pub struct EventHandlers {
    queue: ObservationQueue,
    state: Arc<ConnectionState>,
    health: HealthTracker,
    topic: String,
}

impl EventHandlers {
    pub fn new(
        queue: ObservationQueue,
        state: Arc<ConnectionState>,
        health: HealthTracker,
        topic: impl Into<String>,
    ) -> Self {
        Self { queue, state, health, topic: topic.into() }
    }

    /// Stamps the liveness timestamp whatever the outcome, subscribes on success.
    pub fn on_connect(&self, client: &AsyncClient, outcome: ConnectOutcome) -> Result<(), ConnectError> {
        self.state.touch();

        if !outcome.is_success() {
            error!("Failed to connect to MQTT: {}", outcome);
            return Err(ConnectError::Refused(outcome));
        }

        info!("Connected to MQTT broker");
        client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce)?;
        info!("Subscribed to MQTT topic {}", self.topic);
        self.health.mark_mqtt_connected();
        Ok(())
    }

    pub async fn on_disconnect(&self, reason: impl fmt::Display) {
        self.health.mark_mqtt_disconnected();
        error!("Unexpected MQTT disconnection: {}. Will auto-reconnect", reason);
        tokio::time::sleep(DISCONNECT_PAUSE).await;
    }

    pub fn on_message(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        debug!("Received MQTT message ({} bytes)", text.len());
        self.queue.put(text);
        self.state.touch();
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    params: ConnectionParameters,
    handlers: EventHandlers,
    transport: Transport,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    /// TLS session using rustls with the platform roots.
    pub fn new(params: ConnectionParameters, handlers: EventHandlers) -> Self {
        Self::with_transport(params, handlers, Transport::Tls(Default::default()))
    }

    pub fn with_transport(params: ConnectionParameters, handlers: EventHandlers, transport: Transport) -> Self {
        Self {
            params,
            handlers,
            transport,
            session: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Replaces any existing session with a fresh one. Returns once the broker
    /// acknowledged the connection and the subscription is queued.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.disconnect();

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.params.address, self.params.port, self.params.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.handlers.on_connect(&client, ack.code.into())?;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    // stamp + categorized log; the error itself is returned below
                    let _ = self.handlers.on_connect(&client, ConnectOutcome::from_error(&e));
                    return Err(match e {
                        ConnectionError::ConnectionRefused(code) => ConnectError::Refused(code.into()),
                        other => ConnectError::Connection(other),
                    });
                }
            }
        }

        let task = tokio::spawn(run_event_loop(eventloop, client.clone(), self.handlers.clone()));
        *self.session.lock() = Some(Session { client, task });
        Ok(())
    }

    /// Best-effort teardown of the current session, if any.
    pub fn disconnect(&self) {
        let previous = self.session.lock().take();
        if let Some(session) = previous {
            debug!("Dropping previous MQTT session");
            session.task.abort();
            if let Err(e) = session.client.try_disconnect() {
                debug!("MQTT disconnect not sent: {}", e);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.params.client_id.as_str(),
            self.params.address.as_str(),
            self.params.port,
        );
        options.set_credentials(self.params.username.as_str(), self.params.password.as_str());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_transport(self.transport.clone());
        options
    }
}

impl Connector for ConnectionManager {
    fn connect(&self) -> BoxFuture<'_, Result<(), ConnectError>> {
        ConnectionManager::connect(self).boxed()
    }
}

/// Drives the rumqttc event loop for one session. The loop reconnects by itself on the
/// next poll after an error; the watchdog replaces the whole session when that is not enough.
async fn run_event_loop(mut eventloop: EventLoop, client: AsyncClient, handlers: EventHandlers) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => handlers.on_message(&publish.payload),
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if let Err(e) = handlers.on_connect(&client, ack.code.into()) {
                    warn!("MQTT reconnect not completed: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                handlers.on_disconnect("disconnected by broker").await;
            }
            Ok(_) => {}
            Err(e) => {
                if let ConnectionError::ConnectionRefused(code) = &e {
                    let _ = handlers.on_connect(&client, (*code).into());
                }
                handlers.on_disconnect(e.to_string()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::MqttStatus;
    use ecoflow_devkit::wait_until;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn handlers() -> (EventHandlers, ObservationQueue, Arc<ConnectionState>, HealthTracker) {
        let queue = ObservationQueue::new();
        let state = Arc::new(ConnectionState::new());
        let health = HealthTracker::new();
        let handlers = EventHandlers::new(queue.clone(), state.clone(), health.clone(), QUOTA_TOPIC);
        (handlers, queue, state, health)
    }

    fn offline_client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10)
    }

    #[test]
    fn test_outcome_from_return_code() {
        assert_eq!(ConnectOutcome::from(ConnectReturnCode::Success), ConnectOutcome::Success);
        assert_eq!(
            ConnectOutcome::from(ConnectReturnCode::BadUserNamePassword),
            ConnectOutcome::BadCredentials
        );
        assert_eq!(
            ConnectOutcome::from(ConnectReturnCode::ServiceUnavailable),
            ConnectOutcome::ServerUnavailable
        );
        assert_eq!(
            ConnectOutcome::from_error(&ConnectionError::NetworkTimeout),
            ConnectOutcome::Timeout
        );
        assert_eq!(
            ConnectOutcome::from_error(&ConnectionError::RequestsDone),
            ConnectOutcome::Other
        );
        assert_eq!(ConnectOutcome::NotAuthorized.to_string(), "not authorized");
    }

    #[test]
    fn test_on_message_queues_and_stamps() {
        let (handlers, queue, state, _) = handlers();
        assert!(state.last_message().is_none());

        handlers.on_message(br#"{"params":{"pd.soc":80}}"#);
        handlers.on_message(&[b'{', 0xff, b'}']);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_get().unwrap(), r#"{"params":{"pd.soc":80}}"#);
        assert_eq!(queue.try_get().unwrap(), "{\u{fffd}}");
        assert!(state.last_message().is_some());
    }

    #[tokio::test]
    async fn test_on_connect_success_subscribes() {
        let (handlers, _, state, health) = handlers();
        let (client, _eventloop) = offline_client();

        handlers.on_connect(&client, ConnectOutcome::Success).unwrap();
        assert_eq!(health.mqtt_status(), MqttStatus::Connected);
        assert!(state.last_message().is_some());
    }

    #[tokio::test]
    async fn test_on_connect_failure_still_stamps() {
        let (handlers, _, state, health) = handlers();
        let (client, _eventloop) = offline_client();

        let err = handlers.on_connect(&client, ConnectOutcome::NotAuthorized).unwrap_err();
        assert!(matches!(err, ConnectError::Refused(ConnectOutcome::NotAuthorized)));
        assert!(state.last_message().is_some());
        assert_eq!(health.mqtt_status(), MqttStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_disconnect_pauses() {
        let (handlers, _, _, health) = handlers();
        let started = tokio::time::Instant::now();

        handlers.on_disconnect("connection reset").await;
        assert!(started.elapsed() >= DISCONNECT_PAUSE);
        assert_eq!(health.mqtt_status(), MqttStatus::Disconnected);
    }

    const QUOTA_TOPIC: &str = "/open/u/SN/quota";
    const QUOTA_PAYLOAD: &[u8] = br#"{"params":{"pd.soc":80}}"#;

    /// Reads one MQTT packet: (fixed header byte, body). `None` once the peer is gone.
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let (mut len, mut shift) = (0usize, 0);
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x30, (2 + topic.len() + payload.len()) as u8];
        frame.extend((topic.len() as u16).to_be_bytes());
        frame.extend(topic.as_bytes());
        frame.extend(payload);
        frame
    }

    /// MQTT 3.1.1 broker stub: answers the n-th CONNECT with `return_codes[n]`. Accepted
    /// sessions get their SUBACK followed by one quota message.
    async fn spawn_broker(return_codes: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            for code in return_codes {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(serve_session(stream, code));
            }
        });
        port
    }

    async fn serve_session(mut stream: TcpStream, code: u8) {
        match read_packet(&mut stream).await {
            Some((header, _)) if header >> 4 == 1 => {}
            _ => return,
        }
        if stream.write_all(&[0x20, 0x02, 0x00, code]).await.is_err() || code != 0 {
            return;
        }
        while let Some((header, body)) = read_packet(&mut stream).await {
            match header >> 4 {
                // SUBSCRIBE
                8 => {
                    let mut frame = vec![0x90, 0x03, body[0], body[1], 0x01];
                    frame.extend(publish_frame(QUOTA_TOPIC, QUOTA_PAYLOAD));
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                // PINGREQ
                12 => {
                    let _ = stream.write_all(&[0xd0, 0x00]).await;
                }
                _ => {}
            }
        }
    }

    fn local_params(port: u16) -> ConnectionParameters {
        ConnectionParameters {
            address: "127.0.0.1".into(),
            port,
            username: "open-abc".into(),
            password: "pw".into(),
            client_id: "ecoflow-exporter-test".into(),
            topic: QUOTA_TOPIC.into(),
        }
    }

    #[tokio::test]
    async fn test_connect_replaces_session_and_dispatches_messages() {
        let port = spawn_broker(vec![0, 0]).await;
        let (handlers, queue, state, health) = handlers();
        let manager = ConnectionManager::with_transport(local_params(port), handlers, Transport::Tcp);

        manager.connect().await.unwrap();
        assert!(state.last_message().is_some());
        assert_eq!(health.mqtt_status(), MqttStatus::Connected);
        assert!(manager.is_connected());
        assert!(wait_until(Duration::from_secs(5), || {
            let len = queue.len();
            async move { len == 1 }
        })
        .await);

        let first_session = manager
            .session
            .lock()
            .as_ref()
            .map(|session| session.task.abort_handle())
            .unwrap();
        manager.connect().await.unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let done = first_session.is_finished();
            async move { done }
        })
        .await);
        assert!(manager.is_connected());

        // the replacement session dispatches on its own
        assert!(wait_until(Duration::from_secs(5), || {
            let len = queue.len();
            async move { len == 2 }
        })
        .await);
        assert_eq!(queue.try_get().unwrap().as_bytes(), QUOTA_PAYLOAD);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_connect_refused_stamps_and_returns_outcome() {
        // 5 = not authorized
        let port = spawn_broker(vec![5]).await;
        let (handlers, queue, state, health) = handlers();
        let manager = ConnectionManager::with_transport(local_params(port), handlers, Transport::Tcp);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused(ConnectOutcome::NotAuthorized)));
        assert!(state.last_message().is_some());
        assert_eq!(health.mqtt_status(), MqttStatus::Connecting);
        assert!(!manager.is_connected());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_manager_starts_without_session() {
        let (handlers, _, _, _) = handlers();
        let params = ConnectionParameters {
            address: "mqtt-e.ecoflow.com".into(),
            port: 8883,
            username: "open-abc".into(),
            password: "pw".into(),
            client_id: "ecoflow-exporter-1234abcd".into(),
            topic: "/open/open-abc/SN/quota".into(),
        };
        let manager = ConnectionManager::new(params, handlers);
        assert!(!manager.is_connected());
        // no-op without a session
        manager.disconnect();
        assert_eq!(manager.params().port, 8883);
    }
}
