#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::BTreeMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use super::config::{Config, ReconnectConfig};
use super::error::WsError;
use super::params::{self, ParamValue, effective_url};
use super::transport::{ABNORMAL_CLOSURE, Session, Transport, TransportEvent};
use crate::Result;
use crate::log::Logger;
use crate::router::MessageSink;

/// Broadcast channel capacity for connection events.
const BROADCAST_CAPACITY: usize = 1024;

/// How long a closing session may take to confirm before it is dropped.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lifecycle status of the managed connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionStatus {
    /// No session and no pending attempt
    Idle,
    /// A session is opening, or a reconnection attempt is pending
    Connecting,
    /// The session is open
    Connected,
    /// Teardown requested, waiting for the session to confirm
    Closing,
}

/// Point-in-time copy of the connection manager's observable state.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    /// Effective URL of the current endpoint, overlay applied
    pub endpoint: Url,
    pub endpoint_index: usize,
    pub attempts_on_current_endpoint: u32,
    pub completed_cycles: u32,
    /// Whether the user currently wants the connection up
    pub desired_connected: bool,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, ParamValue>,
    /// Whether a transport session is attached
    pub has_session: bool,
    /// Whether a reconnection attempt is waiting on its backoff delay
    pub reconnect_pending: bool,
    /// Whether the keep-alive timer is running
    pub heartbeat_active: bool,
}

impl ConnectionSnapshot {
    /// Idle snapshot for `endpoint`, for dispatching payloads that did not come from a manager.
    #[must_use]
    pub fn idle(endpoint: Url) -> Self {
        Self {
            status: ConnectionStatus::Idle,
            endpoint,
            endpoint_index: 0,
            attempts_on_current_endpoint: 0,
            completed_cycles: 0,
            desired_connected: false,
            message_count: 0,
            last_message_at: None,
            params: BTreeMap::new(),
            has_session: false,
            reconnect_pending: false,
            heartbeat_active: false,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// No session, no reconnect timer and no heartbeat are held.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        !self.has_session && !self.reconnect_pending && !self.heartbeat_active
    }
}

/// Events emitted by the connection manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened {
        endpoint: Url,
    },
    Closed {
        code: u16,
        reason: String,
    },
    Errored {
        error: String,
    },
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        endpoint: Url,
    },
    EndpointSwitched {
        from: usize,
        to: usize,
        cycle: u32,
    },
    MessageReceived {
        raw: Arc<[u8]>,
        /// State as of this message's arrival, `message_count` included
        connection: ConnectionSnapshot,
    },
    /// Automatic recovery stopped; nothing further happens until the next `connect`
    GaveUp {
        endpoint: Url,
        cycles: u32,
    },
}

#[derive(Debug)]
enum Command {
    Connect,
    Close,
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    UpdateParams(BTreeMap<String, ParamValue>),
}

/// Manages one logical WebSocket connection across reconnects and endpoint failover.
///
/// All state lives in a background task that serializes user commands and transport events,
/// so at most one transport session exists at any instant. The handle is cheap to clone;
/// dropping the last clone stops the task and releases the session.
///
/// # Example
///
/// ```no_run
/// use resilient_ws::ws::ConnectionManager;
/// use resilient_ws::ws::config::Config;
///
/// # async fn example() -> resilient_ws::Result<()> {
/// let config = Config::builder()
///     .endpoints(vec!["wss://example.com/stream".to_owned()])
///     .build();
/// let connection = ConnectionManager::new(config)?;
///
/// let mut events = connection.subscribe();
/// connection.connect();
///
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    /// Watch channel receiver for the latest published snapshot
    state_rx: watch::Receiver<ConnectionSnapshot>,
    /// Broadcast sender for lifecycle and message events
    broadcast_tx: broadcast::Sender<ConnectionEvent>,
    /// Stops the background task once the last handle is dropped
    _shutdown: Arc<DropGuard>,
}

impl ConnectionManager {
    /// Create a connection manager using the default WebSocket transport.
    ///
    /// The manager starts idle; call [`Self::connect`] to open the connection.
    #[cfg(feature = "ws")]
    pub fn new(config: Config) -> Result<Self> {
        Self::with_transport(
            config,
            super::transport::WsTransport,
            crate::log::default_logger(),
        )
    }

    /// Create a connection manager over a custom transport and logger.
    pub fn with_transport<T: Transport>(
        config: Config,
        transport: T,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let endpoints = config.validate()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let mut actor = Actor {
            transport: Box::new(transport),
            logger,
            endpoints,
            params: config.params,
            heartbeat_interval: config.heartbeat_interval,
            policy: config.reconnect,
            status: ConnectionStatus::Idle,
            session: None,
            endpoint_index: 0,
            attempts: 0,
            completed_cycles: 0,
            desired_connected: false,
            message_count: 0,
            last_message_at: None,
            timer: None,
            heartbeat: None,
            state_tx: None,
            broadcast_tx: broadcast_tx.clone(),
        };
        let (state_tx, state_rx) = watch::channel(actor.snapshot());
        actor.state_tx = Some(state_tx);

        let shutdown = CancellationToken::new();
        tokio::spawn(actor.run(commands_rx, shutdown.clone()));

        Ok(Self {
            commands,
            state_rx,
            broadcast_tx,
            _shutdown: Arc::new(shutdown.drop_guard()),
        })
    }

    /// Start connecting. No-op while already connecting or connected.
    pub fn connect(&self) {
        _ = self.commands.send(Command::Connect);
    }

    /// Stop the connection and cancel any pending reconnection. Idempotent.
    pub fn close(&self) {
        _ = self.commands.send(Command::Close);
    }

    /// Send `data` over the open session.
    ///
    /// Returns `false` without queueing when no session is open or the transport rejects it.
    pub async fn send<D: Into<Vec<u8>>>(&self, data: D) -> bool {
        self.outbound().send_bytes(data.into()).await
    }

    /// Merge `partial` into the query parameter overlay and reconnect with the new URL.
    ///
    /// The endpoint index is kept; attempt and cycle counters start over. While the manager
    /// is not meant to be connected only the overlay changes.
    pub fn update_params<I, K, V>(&self, partial: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let partial = partial
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        _ = self.commands.send(Command::UpdateParams(partial));
    }

    /// Get the latest connection snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_rx.clone()
    }

    /// Subscribe to connection events.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Connection events as a stream. The stream ends with an error if it falls behind.
    pub fn events(&self) -> impl Stream<Item = Result<ConnectionEvent>> + use<> {
        let mut rx = self.broadcast_tx.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(count)) => {
                        Err(WsError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// A send-only handle that does not keep the manager alive.
    #[must_use]
    pub fn outbound(&self) -> Outbound {
        Outbound {
            commands: self.commands.clone(),
        }
    }
}

/// Send capability handed to message handlers.
#[derive(Debug, Clone)]
pub struct Outbound {
    commands: mpsc::UnboundedSender<Command>,
}

impl Outbound {
    async fn send_bytes(&self, data: Vec<u8>) -> bool {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Send { data, reply }).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }
}

#[async_trait]
impl MessageSink for Outbound {
    async fn send(&self, data: Vec<u8>) -> bool {
        self.send_bytes(data).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    CloseGrace,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    at: Instant,
    kind: TimerKind,
}

struct ActiveSession {
    handle: Box<dyn Session>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Single owner of all mutable connection state.
struct Actor {
    transport: Box<dyn Transport>,
    logger: Arc<dyn Logger>,
    endpoints: Vec<Url>,
    params: BTreeMap<String, ParamValue>,
    heartbeat_interval: Duration,
    policy: ReconnectConfig,
    status: ConnectionStatus,
    session: Option<ActiveSession>,
    endpoint_index: usize,
    attempts: u32,
    completed_cycles: u32,
    desired_connected: bool,
    message_count: u64,
    last_message_at: Option<DateTime<Utc>>,
    /// Reconnect delay or close grace period; never both
    timer: Option<Timer>,
    heartbeat: Option<Interval>,
    state_tx: Option<watch::Sender<ConnectionSnapshot>>,
    broadcast_tx: broadcast::Sender<ConnectionEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command);
                }

                event = next_event(&mut self.session) => {
                    self.handle_transport_event(event);
                }

                () = wait_for(self.timer) => {
                    self.fire_timer();
                }

                () = next_tick(&mut self.heartbeat) => {
                    self.send_keep_alive();
                }
            }

            self.publish();
        }

        self.desired_connected = false;
        self.timer = None;
        self.stop_heartbeat();
        self.detach_session();
        self.status = ConnectionStatus::Idle;
        self.publish();
        self.logger.debug("connection manager stopped", None);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::Send { data, reply } => {
                _ = reply.send(self.send(data));
            }
            Command::UpdateParams(partial) => self.update_params(partial),
        }
    }

    fn connect(&mut self) {
        if matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            self.logger.debug(
                "connect ignored, already active",
                Some(&json!({ "status": self.status.to_string() })),
            );
            return;
        }

        self.desired_connected = true;
        self.attempts = 0;
        self.completed_cycles = 0;
        self.open_session();
    }

    fn close(&mut self) {
        self.desired_connected = false;
        // Already waiting on the session; the grace deadline stands.
        if self.status == ConnectionStatus::Closing && self.session.is_some() {
            return;
        }
        self.timer = None;
        self.stop_heartbeat();

        match &self.session {
            Some(active) => {
                self.logger.info(
                    "closing connection",
                    Some(&json!({ "endpoint": self.current_url().as_str() })),
                );
                active.handle.close();
                self.status = ConnectionStatus::Closing;
                self.timer = Some(Timer {
                    at: Instant::now() + CLOSE_GRACE_PERIOD,
                    kind: TimerKind::CloseGrace,
                });
            }
            None => self.status = ConnectionStatus::Idle,
        }
    }

    fn send(&self, data: Vec<u8>) -> bool {
        let Some(active) = &self.session else {
            return false;
        };
        if self.status != ConnectionStatus::Connected || !active.handle.is_open() {
            return false;
        }

        match active.handle.send(data) {
            Ok(()) => true,
            Err(e) => {
                self.logger
                    .warn("send failed", Some(&json!({ "error": e.to_string() })));
                false
            }
        }
    }

    fn update_params(&mut self, partial: BTreeMap<String, ParamValue>) {
        params::merge(&mut self.params, partial);

        if !self.desired_connected {
            return;
        }

        self.logger.info(
            "query parameters changed, reconnecting",
            Some(&json!({ "endpoint": self.current_url().as_str() })),
        );
        self.attempts = 0;
        self.completed_cycles = 0;
        self.open_session();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(bytes) => {
                self.message_count = self.message_count.saturating_add(1);
                self.last_message_at = Some(Utc::now());
                self.emit(ConnectionEvent::MessageReceived {
                    raw: bytes.into(),
                    connection: self.snapshot(),
                });
            }
            TransportEvent::Errored(error) => {
                self.logger.warn(
                    "transport error",
                    Some(&json!({
                        "endpoint": self.current_url().as_str(),
                        "error": error,
                    })),
                );
                self.emit(ConnectionEvent::Errored { error });
            }
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
        }
    }

    fn on_opened(&mut self) {
        if self.status == ConnectionStatus::Closing {
            // Opened after close was requested; ask again and keep waiting for Closed.
            if let Some(active) = &self.session {
                active.handle.close();
            }
            return;
        }

        let endpoint = self.current_url();
        self.logger.info(
            "connection opened",
            Some(&json!({ "endpoint": endpoint.as_str() })),
        );

        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.completed_cycles = 0;
        self.start_heartbeat();
        self.emit(ConnectionEvent::Opened { endpoint });
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        self.session = None;
        self.stop_heartbeat();
        self.timer = None;

        self.logger.info(
            "connection closed",
            Some(&json!({ "code": code, "reason": reason })),
        );
        self.emit(ConnectionEvent::Closed { code, reason });

        if self.desired_connected {
            self.recover();
        } else {
            self.status = ConnectionStatus::Idle;
        }
    }

    /// Count the failure, then retry the current endpoint with backoff, fail over to the next,
    /// or give up.
    fn recover(&mut self) {
        let max_attempts = self.policy.max_attempts_per_endpoint;

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < max_attempts {
            let delay = self.policy.delay_for_attempt(self.attempts);
            let endpoint = self.current_url();

            self.logger.info(
                "reconnect scheduled",
                Some(&json!({
                    "endpoint": endpoint.as_str(),
                    "attempt": self.attempts,
                    "max_attempts": max_attempts,
                    "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                })),
            );

            self.status = ConnectionStatus::Connecting;
            self.timer = Some(Timer {
                at: Instant::now() + delay,
                kind: TimerKind::Reconnect,
            });
            self.emit(ConnectionEvent::ReconnectScheduled {
                attempt: self.attempts,
                max_attempts,
                delay,
                endpoint,
            });
            return;
        }

        if self.endpoints.len() > 1 && self.completed_cycles < self.policy.max_endpoint_cycles {
            let from = self.endpoint_index;
            let to = (from + 1) % self.endpoints.len();

            if to == 0 {
                self.completed_cycles += 1;
                if self.completed_cycles >= self.policy.max_endpoint_cycles {
                    self.endpoint_index = 0;
                    self.give_up();
                    return;
                }
            }

            self.endpoint_index = to;
            self.attempts = 0;

            self.logger.warn(
                "switching endpoint",
                Some(&json!({
                    "from": self.endpoints[from].as_str(),
                    "to": self.endpoints[to].as_str(),
                    "cycle": self.completed_cycles,
                })),
            );
            self.emit(ConnectionEvent::EndpointSwitched {
                from,
                to,
                cycle: self.completed_cycles,
            });
            self.open_session();
            return;
        }

        self.give_up();
    }

    fn give_up(&mut self) {
        self.timer = None;
        self.status = ConnectionStatus::Idle;

        let endpoint = self.current_url();
        self.logger.error(
            "reconnection attempts exhausted",
            Some(&json!({
                "endpoint": endpoint.as_str(),
                "cycles": self.completed_cycles,
            })),
        );
        self.emit(ConnectionEvent::GaveUp {
            endpoint,
            cycles: self.completed_cycles,
        });
    }

    fn fire_timer(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };

        match timer.kind {
            TimerKind::Reconnect => {
                if self.desired_connected {
                    self.open_session();
                }
            }
            TimerKind::CloseGrace => {
                self.logger
                    .warn("session did not confirm close, dropping it", None);
                self.detach_session();
                self.status = ConnectionStatus::Idle;
                self.emit(ConnectionEvent::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "close timed out".to_owned(),
                });
            }
        }
    }

    /// Replace any current session with a fresh one to the current effective URL.
    fn open_session(&mut self) {
        self.stop_heartbeat();
        self.timer = None;
        self.detach_session();

        let url = self.current_url();
        self.logger.debug(
            "opening session",
            Some(&json!({
                "endpoint": url.as_str(),
                "index": self.endpoint_index,
                "attempt": self.attempts,
            })),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = self.transport.open(&url, events_tx);
        self.session = Some(ActiveSession {
            handle,
            events: events_rx,
        });
        self.status = ConnectionStatus::Connecting;
    }

    /// Close the current session and stop listening to it.
    ///
    /// Dropping the event receiver means nothing the session emits afterwards is observed.
    fn detach_session(&mut self) {
        if let Some(active) = self.session.take() {
            active.handle.close();
        }
    }

    fn start_heartbeat(&mut self) {
        let period = self.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    fn send_keep_alive(&self) {
        if let Some(active) = &self.session
            && let Err(e) = active.handle.keep_alive()
        {
            self.logger
                .warn("keep-alive failed", Some(&json!({ "error": e.to_string() })));
        }
    }

    fn current_url(&self) -> Url {
        effective_url(&self.endpoints[self.endpoint_index], &self.params)
    }

    fn emit(&self, event: ConnectionEvent) {
        _ = self.broadcast_tx.send(event);
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            endpoint: self.current_url(),
            endpoint_index: self.endpoint_index,
            attempts_on_current_endpoint: self.attempts,
            completed_cycles: self.completed_cycles,
            desired_connected: self.desired_connected,
            message_count: self.message_count,
            last_message_at: self.last_message_at,
            params: self.params.clone(),
            has_session: self.session.is_some(),
            reconnect_pending: self
                .timer
                .is_some_and(|timer| timer.kind == TimerKind::Reconnect),
            heartbeat_active: self.heartbeat.is_some(),
        }
    }

    fn publish(&self) {
        if let Some(state_tx) = &self.state_tx {
            state_tx.send_if_modified(|current| {
                let next = self.snapshot();
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }
    }
}

async fn next_event(session: &mut Option<ActiveSession>) -> TransportEvent {
    match session {
        Some(active) => active
            .events
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "transport dropped".to_owned(),
            }),
        None => pending().await,
    }
}

async fn wait_for(timer: Option<Timer>) {
    match timer {
        Some(timer) => sleep_until(timer.at).await,
        None => pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}
