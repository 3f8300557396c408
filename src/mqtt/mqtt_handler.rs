use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::config::SessionConfig;
use super::message_manager::{MessageLog, MessageLogEntry};
use super::transport::{EventSink, SessionEvent, SessionHandle, SessionId, Transport, TransportEvent};

/// Connection state as observed by the UI. Exactly one is current at any time.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// What can move the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// `connect()` from the caller
    Connect,
    /// `disconnect()` from the caller
    Disconnect,
    /// The transport reports an accepted connection
    TransportConnected,
    /// The transport reports a failed attempt or a lost link
    TransportFailed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed => "Failed",
        }
    }

    /// Status text shown next to the connection indicator
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "已断开",
            ConnectionState::Connecting => "连接中...",
            ConnectionState::Connected => "已连接",
            ConnectionState::Failed => "连接失败",
        }
    }

    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    pub fn can_disconnect(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }

    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Next state for `trigger`, or `None` when the trigger is ignored here.
    ///
    /// ```text
    /// Disconnected --Connect--> Connecting
    /// Failed       --Connect--> Connecting
    /// Connecting   --TransportConnected--> Connected
    /// Failed       --TransportConnected--> Connected   (silent reconnect)
    /// Connecting   --TransportFailed--> Failed
    /// Connected    --TransportFailed--> Failed
    /// any but Disconnected --Disconnect--> Disconnected
    /// ```
    pub fn on(self, trigger: Trigger) -> Option<ConnectionState> {
        use ConnectionState::{Connected, Connecting, Disconnected, Failed};

        match (self, trigger) {
            (Disconnected | Failed, Trigger::Connect) => Some(Connecting),
            (Connecting | Connected | Failed, Trigger::Disconnect) => Some(Disconnected),
            (Connecting | Failed, Trigger::TransportConnected) => Some(Connected),
            (Connecting | Connected, Trigger::TransportFailed) => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct ActiveSession {
    id: SessionId,
    /// Topic of the snapshot the session was opened with
    topic: String,
    handle: Box<dyn SessionHandle>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: Mutex<SessionConfig>,
    session: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<ConnectionState>,
    log_tx: watch::Sender<MessageLog>,
    /// Sessions whose transport has not reported `Closed` yet, current or not
    open_sessions: watch::Sender<BTreeSet<SessionId>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_session: AtomicU64,
    next_order: AtomicU64,
}

/// Owns the single MQTT session of the application.
///
/// Commands return immediately; outcomes show up later on the state and
/// message-log watch channels. Every state change happens while the session
/// slot is locked, so a transport event can never interleave with a command
/// halfway through.
pub struct SessionManager {
    inner: Arc<Inner>,
    event_task: JoinHandle<()>,
}

impl SessionManager {
    /// Creates the manager and starts its event task on the current runtime.
    ///
    /// `log_capacity` bounds the message log; `None` keeps every message.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        log_capacity: Option<usize>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (log_tx, _) = watch::channel(MessageLog::new(log_capacity));
        let (open_sessions, _) = watch::channel(BTreeSet::new());

        let inner = Arc::new(Inner {
            transport,
            config: Mutex::new(config),
            session: Mutex::new(None),
            state_tx,
            log_tx,
            open_sessions,
            events_tx,
            next_session: AtomicU64::new(0),
            next_order: AtomicU64::new(0),
        });

        let event_task = tokio::spawn(run_events(inner.clone(), events_rx));
        debug!("Session manager started");

        Self { inner, event_task }
    }

    /// Replaces the stored configuration. A live session keeps running with the
    /// snapshot it was opened with.
    pub fn configure(&self, config: SessionConfig) {
        info!("Configuration set to {}", config);
        *self.inner.lock_config() = config;
        if self.state() != ConnectionState::Disconnected {
            info!("New configuration takes effect on the next connect");
        }
    }

    pub fn connect(&self) {
        let mut session = self.inner.lock_session();
        let current = self.state();
        let Some(next) = current.on(Trigger::Connect) else {
            warn!("Connect ignored, session is already {}", current);
            return;
        };

        if let Some(old) = session.take() {
            debug!("Closing session {} before reconnecting", old.id);
            if let Err(e) = old.handle.close() {
                warn!("Closing session {} failed: {}", old.id, e);
            }
        }

        let config = self.config();
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        self.inner.set_state(next);

        let sink = EventSink::new(id, self.inner.events_tx.clone());
        match self.inner.transport.open(&config, sink) {
            Ok(handle) => {
                info!("Connecting to {} (session {})", config, id);
                self.inner.open_sessions.send_modify(|open| {
                    open.insert(id);
                });
                *session = Some(ActiveSession {
                    id,
                    topic: config.topic,
                    handle,
                });
            }
            Err(e) => {
                error!("Could not start connection to {}: {}", config, e);
                self.inner.set_state(ConnectionState::Failed);
            }
        }
    }

    /// Always leaves the manager `Disconnected`, whatever the transport says
    /// about closing afterwards.
    pub fn disconnect(&self) {
        let mut session = self.inner.lock_session();
        let current = self.state();
        match current.on(Trigger::Disconnect) {
            Some(next) => self.inner.set_state(next),
            None => info!("Disconnect ignored, already {}", current),
        }

        if let Some(active) = session.take() {
            match active.handle.close() {
                Ok(()) => info!("Session {} closing", active.id),
                Err(e) => warn!("Closing session {} failed, staying disconnected: {}", active.id, e),
            }
        }
    }

    /// Disconnects and waits up to `grace` for every session's transport to
    /// finish closing, so the DISCONNECT actually leaves before the runtime
    /// goes away. Returns false if something was still open at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.disconnect();

        let mut rx = self.inner.open_sessions.subscribe();
        let res = tokio::time::timeout(grace, rx.wait_for(BTreeSet::is_empty))
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(_)) => {
                debug!("All sessions closed");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                let pending = rx.borrow().len();
                warn!("{} session(s) still closing after {:?}", pending, grace);
                false
            }
        }
    }

    /// Sends `message` to the session's topic. Rejections and delivery failures
    /// are logged only.
    pub fn publish(&self, message: &str) {
        if message.trim().is_empty() {
            warn!("Publish rejected, message is blank");
            return;
        }

        let session = self.inner.lock_session();
        let current = self.state();
        if !current.can_publish() {
            warn!("Publish rejected, not connected (state: {})", current);
            return;
        }
        let Some(active) = session.as_ref() else {
            warn!("Publish rejected, no live session");
            return;
        };

        match active
            .handle
            .publish(&active.topic, message.as_bytes().to_vec())
        {
            Ok(()) => info!("Message '{}' published to '{}'", message, active.topic),
            Err(e) => error!("Publishing to '{}' failed: {}", active.topic, e),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn messages(&self) -> MessageLog {
        self.inner.log_tx.borrow().clone()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<MessageLog> {
        self.inner.log_tx.subscribe()
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.lock_config().clone()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.event_task.abort();
        if let Some(active) = self.inner.lock_session().take() {
            if let Err(e) = active.handle.close() {
                warn!("Closing session {} on shutdown failed: {}", active.id, e);
            }
        }
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> MutexGuard<'_, SessionConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!("Connection state: {} -> {}", previous, next);
        }
    }

    fn handle_event(&self, SessionEvent { session: id, event }: SessionEvent) {
        if event == TransportEvent::Closed {
            self.open_sessions.send_if_modified(|open| open.remove(&id));
        }

        let mut session = self.lock_session();
        if !session.as_ref().is_some_and(|active| active.id == id) {
            trace!("Dropping {:?} from stale session {}", event, id);
            return;
        }

        let current = *self.state_tx.borrow();
        match event {
            TransportEvent::Connected => {
                let Some(next) = current.on(Trigger::TransportConnected) else {
                    debug!("Connected event ignored in state {}", current);
                    return;
                };
                if current == ConnectionState::Failed {
                    info!("Transport reconnected session {}", id);
                }
                if let Some(active) = session.as_ref() {
                    match active.handle.subscribe(&active.topic) {
                        Ok(()) => info!("Subscribing to '{}'", active.topic),
                        Err(e) => error!("Subscribing to '{}' failed: {}", active.topic, e),
                    }
                }
                self.set_state(next);
            }
            TransportEvent::ConnectFailed(reason) | TransportEvent::ConnectionLost(reason) => {
                if let Some(next) = current.on(Trigger::TransportFailed) {
                    warn!("Session {} failed: {}", id, reason);
                    self.set_state(next);
                } else {
                    debug!("Session {} still down: {}", id, reason);
                }
            }
            TransportEvent::Message { topic, payload } => self.append_message(topic, &payload),
            TransportEvent::Delivered => debug!("Message delivered"),
            TransportEvent::SubscribeFailed(reason) => {
                error!("Subscription on session {} failed: {}", id, reason);
            }
            TransportEvent::Closed => {
                info!("Transport closed session {}", id);
                session.take();
                if let Some(next) = current.on(Trigger::TransportFailed) {
                    self.set_state(next);
                }
            }
        }
    }

    fn append_message(&self, topic: String, payload: &[u8]) {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let entry = MessageLogEntry::from_topic(topic, payload, order);
        debug!("{}", entry.text);
        self.log_tx.send_modify(|log| log.push_front(entry));
    }
}

async fn run_events(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event);
    }
    debug!("Session event channel closed");
}
