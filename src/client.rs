//! A connection manager and a router wired together.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast;

use crate::Result;
use crate::log::Logger;
use crate::router::{DispatchError, Handler, MessageSink, Router, Schema};
use crate::ws::config::Config;
use crate::ws::params::ParamValue;
use crate::ws::{ConnectionEvent, ConnectionManager, ConnectionSnapshot, Transport};

/// Broadcast channel capacity for client errors.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection and dispatch failures, unified.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ClientError {
    /// The transport reported an error
    Connection(String),
    /// A payload could not be decoded or a handler failed
    Dispatch(DispatchError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(error) => write!(f, "connection error: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch error: {error}"),
        }
    }
}

impl StdError for ClientError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(_) => None,
            Self::Dispatch(error) => Some(error),
        }
    }
}

/// Resilient connection whose inbound payloads are routed to registered handlers.
///
/// Every received payload is dispatched on its own task, started in arrival order, so a
/// handler may wait on a later payload. Handlers for one payload run concurrently and may
/// reply through their [`Context`](crate::router::Context).
///
/// ```no_run
/// use resilient_ws::client::Client;
/// use resilient_ws::error::HandlerError;
/// use resilient_ws::router::{Context, schema};
/// use resilient_ws::ws::config::Config;
/// use serde_json::Value;
///
/// # async fn example() -> resilient_ws::Result<()> {
/// let config = Config::builder()
///     .endpoints(vec!["wss://example.com/stream".to_owned()])
///     .build();
/// let client = Client::new(config)?;
///
/// client.register(schema::typed::<Value>(), |ctx: Context<Value>| async move {
///     println!("{}", ctx.value);
///     Ok::<_, HandlerError>(())
/// });
/// client.connect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    connection: ConnectionManager,
    router: Arc<Router>,
    errors_tx: broadcast::Sender<ClientError>,
}

impl Client {
    /// Create a client over the default WebSocket transport.
    #[cfg(feature = "ws")]
    pub fn new(config: Config) -> Result<Self> {
        Self::with_transport(
            config,
            crate::ws::WsTransport,
            crate::log::default_logger(),
        )
    }

    /// Create a client over a custom transport and logger.
    pub fn with_transport<T: Transport>(
        config: Config,
        transport: T,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let connection = ConnectionManager::with_transport(config, transport, Arc::clone(&logger))?;
        let router = Arc::new(Router::with_logger(Arc::clone(&logger)));
        let (errors_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        // The forwarding task must not hold a manager handle, or the manager would never stop.
        let forwarder = Forwarder {
            events: connection.subscribe(),
            dispatch_errors: router.errors(),
            sink: Arc::new(connection.outbound()),
            router: Arc::clone(&router),
            errors_tx: errors_tx.clone(),
            logger,
        };
        tokio::spawn(forwarder.run());

        Ok(Self {
            connection,
            router,
            errors_tx,
        })
    }

    /// Register a handler for payloads accepted by `schema`.
    pub fn register<S, H>(&self, schema: S, handler: H) -> &Self
    where
        S: Schema,
        H: Handler<S::Output>,
    {
        self.router.register(schema, handler);
        self
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Send raw bytes. Returns `false` when no session is open.
    pub async fn send<D: Into<Vec<u8>>>(&self, data: D) -> bool {
        self.connection.send(data).await
    }

    /// Serialize `payload` as JSON and send it.
    pub async fn send_json<R: Serialize + ?Sized>(&self, payload: &R) -> Result<bool> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(self.connection.send(bytes).await)
    }

    /// See [`ConnectionManager::update_params`].
    pub fn update_params<I, K, V>(&self, partial: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.connection.update_params(partial);
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    /// Connection lifecycle and message events.
    pub fn events(&self) -> impl Stream<Item = Result<ConnectionEvent>> + use<> {
        self.connection.events()
    }

    /// Subscribe to connection and dispatch failures.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ClientError> {
        self.errors_tx.subscribe()
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

struct Forwarder {
    events: broadcast::Receiver<ConnectionEvent>,
    dispatch_errors: broadcast::Receiver<DispatchError>,
    sink: Arc<dyn MessageSink>,
    router: Arc<Router>,
    errors_tx: broadcast::Sender<ClientError>,
    logger: Arc<dyn Logger>,
}

impl Forwarder {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(ConnectionEvent::MessageReceived { raw, connection }) => {
                        // Handlers may wait on later payloads, so the loop never awaits them.
                        let router = Arc::clone(&self.router);
                        let sink = Arc::clone(&self.sink);
                        tokio::spawn(async move {
                            router.dispatch(raw, sink, connection).await;
                        });
                    }
                    Ok(ConnectionEvent::Errored { error }) => {
                        _ = self.errors_tx.send(ClientError::Connection(error));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        self.logger.warn(
                            "client fell behind connection events",
                            Some(&json!({ "missed": count })),
                        );
                    }
                    Err(RecvError::Closed) => break,
                },

                error = self.dispatch_errors.recv() => match error {
                    Ok(error) => {
                        _ = self.errors_tx.send(ClientError::Dispatch(error));
                    }
                    Err(RecvError::Lagged(count)) => {
                        self.logger.warn(
                            "client fell behind dispatch errors",
                            Some(&json!({ "missed": count })),
                        );
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.logger.debug("client forwarding stopped", None);
    }
}
