//! Transport adapter between the session manager and the MQTT protocol client
//!
//! The manager never talks to `rumqttc` directly. It opens sessions through the
//! [`Transport`] trait and receives everything the broker does as
//! [`TransportEvent`]s pushed into an [`EventSink`]. Each sink is stamped with the
//! id of the session it belongs to, so the manager can tell a live session's
//! events from the leftovers of one it already closed.
//!
//! ```text
//! SessionManager ──open/publish/subscribe/close──► SessionHandle
//!        ▲                                            │
//!        └──────── SessionEvent (mpsc) ◄── driver task (EventLoop::poll)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::SessionConfig;
use super::error::TransportError;

/// Identifies one opened session for the lifetime of a manager
pub type SessionId = u64;

/// Capacity of the request queue between a session handle and its event loop
const DEFAULT_REQUEST_CAPACITY: usize = 100;

/// Everything the transport reports back about a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection (first connect or silent reconnect)
    Connected,
    /// A connection attempt failed before the broker accepted it
    ConnectFailed(String),
    /// An established link went down
    ConnectionLost(String),
    /// A publish arrived on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// The broker acknowledged one of our publishes
    Delivered,
    /// The broker refused a subscription
    SubscribeFailed(String),
    /// The session will not produce further events
    Closed,
}

/// A [`TransportEvent`] tagged with the session that produced it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// Where a transport delivers the events of exactly one session
#[derive(Clone, Debug)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the receiving manager is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Live handle to one opened session. All calls only queue work and return.
pub trait SessionHandle: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Requests an orderly shutdown of the session
    fn close(&self) -> Result<(), TransportError>;
}

/// Opens broker sessions
pub trait Transport: Send + Sync {
    /// Starts connecting in the background and returns immediately.
    ///
    /// Fails only when no attempt can be started at all, e.g. because the
    /// configuration is unusable.
    fn open(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn SessionHandle>, TransportError>;
}

/// [`Transport`] backed by `rumqttc`, one driver task per session
#[derive(Clone, Debug)]
pub struct RumqttcTransport {
    request_capacity: usize,
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl RumqttcTransport {
    fn mqtt_options(config: &SessionConfig) -> MqttOptions {
        let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive)
            .set_clean_session(config.clean_session);

        if let Some((user, password)) = config.credentials() {
            options.set_credentials(user, password);
        }

        if config.uses_tls() {
            debug!("Using TLS for {}:{}", config.host, config.port);
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        options
    }
}

impl Transport for RumqttcTransport {
    fn open(
        &self,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn SessionHandle>, TransportError> {
        config.validate().map_err(TransportError::InvalidConfig)?;

        let options = Self::mqtt_options(config);
        info!(
            "Opening session {} to {}:{} as '{}'",
            events.session(),
            config.host,
            config.port,
            options.client_id()
        );

        let (client, event_loop) = AsyncClient::new(options, self.request_capacity);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            event_loop,
            events,
            cancel: cancel.clone(),
            connected: connected.clone(),
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay,
        };
        tokio::spawn(driver.run());

        Ok(Box::new(RumqttcSession {
            client,
            cancel,
            connected,
        }))
    }
}

struct RumqttcSession {
    client: AsyncClient,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl SessionHandle for RumqttcSession {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn close(&self) -> Result<(), TransportError> {
        let result = self
            .client
            .try_disconnect()
            .map_err(|e| TransportError::Close(e.to_string()));

        // Without a live link the DISCONNECT would only sit in the queue while the
        // event loop keeps retrying, so stop the driver right away.
        if result.is_err() || !self.connected.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
        result
    }
}

/// Pumps one `rumqttc` event loop and translates what it sees
struct Driver {
    event_loop: EventLoop,
    events: EventSink,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    auto_reconnect: bool,
    reconnect_delay: Duration,
}

impl Driver {
    async fn run(mut self) {
        let session = self.events.session();
        debug!("Driver for session {} started", session);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Driver for session {} cancelled", session);
                    break;
                }
                polled = self.event_loop.poll() => match polled {
                    Ok(event) => {
                        if self.handle_event(event) {
                            break;
                        }
                    }
                    Err(e) => {
                        if !self.handle_error(&e) {
                            break;
                        }
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        self.events.emit(TransportEvent::Closed);
        debug!("Driver for session {} stopped", session);
    }

    /// Returns true when the driver should stop
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected.store(true, Ordering::Release);
                    self.events.emit(TransportEvent::Connected);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Received publish on topic {}", publish.topic);
                self.events.emit(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Event::Incoming(Packet::PubAck(_)) | Event::Incoming(Packet::PubComp(_)) => {
                self.events.emit(TransportEvent::Delivered);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    self.events.emit(TransportEvent::SubscribeFailed(format!(
                        "broker refused subscription (pkid {})",
                        ack.pkid
                    )));
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.connected.store(false, Ordering::Release);
                self.events
                    .emit(TransportEvent::ConnectionLost("disconnected by broker".into()));
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("DISCONNECT sent for session {}", self.events.session());
                return true;
            }
            other => trace!("Unhandled MQTT event: {:?}", other),
        }
        false
    }

    /// Reports a poll failure. Returns true when another attempt should follow.
    fn handle_error(&mut self, e: &ConnectionError) -> bool {
        let reason = e.to_string();
        if self.connected.swap(false, Ordering::AcqRel) {
            error!("Connection lost: {}", reason);
            self.events.emit(TransportEvent::ConnectionLost(reason));
        } else {
            error!("Connection attempt failed: {}", reason);
            self.events.emit(TransportEvent::ConnectFailed(reason));
        }

        if is_fatal_error(e) {
            error!("Fatal transport error, giving up on session {}", self.events.session());
            return false;
        }
        if !self.auto_reconnect {
            info!("Automatic reconnect disabled, closing session {}", self.events.session());
            return false;
        }
        debug!(
            "Retrying session {} in {:.1}s",
            self.events.session(),
            self.reconnect_delay.as_secs_f64()
        );
        true
    }
}

/// Errors that another attempt with the same configuration cannot fix
fn is_fatal_error(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::ConnectionRefused(_)
            | ConnectionError::Tls(_)
            | ConnectionError::RequestsDone
    )
}

#[cfg(test)]
pub mod mock {
    //! Recording transport for exercising the manager without a broker

    use std::sync::{Arc, Mutex, MutexGuard};

    use super::{EventSink, SessionHandle, SessionId, Transport, TransportEvent};
    use crate::mqtt::config::SessionConfig;
    use crate::mqtt::error::TransportError;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Open {
            session: SessionId,
            host: String,
            port: u16,
            topic: String,
            credentials: Option<(String, String)>,
            tls: bool,
        },
        Publish {
            session: SessionId,
            topic: String,
            payload: String,
        },
        Subscribe {
            session: SessionId,
            topic: String,
        },
        Close {
            session: SessionId,
        },
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<Call>,
        sinks: Vec<EventSink>,
        fail_open: bool,
        fail_publish: bool,
        fail_subscribe: bool,
        fail_close: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.lock().calls.clone()
        }

        pub fn opens(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Open { .. }))
                .count()
        }

        pub fn publishes(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish { topic, payload, .. } => Some((topic, payload)),
                    _ => None,
                })
                .collect()
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Subscribe { topic, .. } => Some(topic),
                    _ => None,
                })
                .collect()
        }

        pub fn closes(&self) -> Vec<SessionId> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Close { session } => Some(session),
                    _ => None,
                })
                .collect()
        }

        /// Emits on the most recently opened session
        pub fn emit(&self, event: TransportEvent) {
            let sink = self.lock().sinks.last().cloned();
            if let Some(sink) = sink {
                sink.emit(event);
            }
        }

        /// Emits on the `index`-th opened session, counting from 0
        pub fn emit_on(&self, index: usize, event: TransportEvent) {
            let sink = self.lock().sinks.get(index).cloned();
            if let Some(sink) = sink {
                sink.emit(event);
            }
        }

        pub fn fail_open(&self, fail: bool) {
            self.lock().fail_open = fail;
        }

        pub fn fail_publish(&self, fail: bool) {
            self.lock().fail_publish = fail;
        }

        pub fn fail_subscribe(&self, fail: bool) {
            self.lock().fail_subscribe = fail;
        }

        pub fn fail_close(&self, fail: bool) {
            self.lock().fail_close = fail;
        }
    }

    impl Transport for MockTransport {
        fn open(
            &self,
            config: &SessionConfig,
            events: EventSink,
        ) -> Result<Box<dyn SessionHandle>, TransportError> {
            let session = events.session();
            let mut state = self.lock();
            state.calls.push(Call::Open {
                session,
                host: config.host.clone(),
                port: config.port,
                topic: config.topic.clone(),
                credentials: config.credentials(),
                tls: config.uses_tls(),
            });
            if state.fail_open {
                return Err(TransportError::InvalidConfig("refused by mock".into()));
            }
            state.sinks.push(events);
            Ok(Box::new(MockSession {
                session,
                state: self.state.clone(),
            }))
        }
    }

    struct MockSession {
        session: SessionId,
        state: Arc<Mutex<MockState>>,
    }

    impl SessionHandle for MockSession {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Publish {
                session: self.session,
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(&payload).into_owned(),
            });
            if state.fail_publish {
                return Err(TransportError::Publish("queue full".into()));
            }
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Subscribe {
                session: self.session,
                topic: topic.to_string(),
            });
            if state.fail_subscribe {
                return Err(TransportError::Subscribe("queue full".into()));
            }
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Close {
                session: self.session,
            });
            if state.fail_close {
                return Err(TransportError::Close("link already gone".into()));
            }
            Ok(())
        }
    }
}
