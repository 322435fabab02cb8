use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::MessageSink;
use crate::Result;
use crate::error::HandlerError;
use crate::ws::ConnectionSnapshot;

/// Everything a handler receives for one matched payload.
#[non_exhaustive]
pub struct Context<T> {
    /// The value produced by the registration's schema
    pub value: T,
    /// The payload exactly as received
    pub raw: Arc<[u8]>,
    /// Connection state at the time the payload was received
    pub connection: ConnectionSnapshot,
    sink: Arc<dyn MessageSink>,
}

impl<T> Context<T> {
    pub(crate) fn new(
        value: T,
        raw: Arc<[u8]>,
        connection: ConnectionSnapshot,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            value,
            raw,
            connection,
            sink,
        }
    }

    /// The raw payload as text, if it is valid UTF-8.
    #[must_use]
    pub fn raw_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }

    /// Send a reply over the connection the payload arrived on.
    ///
    /// Returns `false` when the connection is not open.
    pub async fn send<D: Into<Vec<u8>>>(&self, data: D) -> bool {
        self.sink.send(data.into()).await
    }

    /// Serialize `payload` as JSON and send it.
    pub async fn send_json<R: Serialize + ?Sized>(&self, payload: &R) -> Result<bool> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(self.send(bytes).await)
    }
}

impl<T: fmt::Debug> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("value", &self.value)
            .field("raw_len", &self.raw.len())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Handles payloads accepted by a schema.
///
/// Implemented for any `Fn(Context<T>) -> impl Future<Output = Result<(), E>>`, so most
/// handlers are closures:
///
/// ```
/// use resilient_ws::error::HandlerError;
/// use resilient_ws::router::{Context, Router, schema};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Ping {
///     id: u64,
/// }
///
/// let router = Router::new();
/// router.register(schema::tagged::<Ping>("type", "ping"), |ctx: Context<Ping>| async move {
///     let id = ctx.value.id;
///     ctx.send(format!(r#"{{"type":"pong","id":{id}}}"#)).await;
///     Ok::<_, HandlerError>(())
/// });
/// ```
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, ctx: Context<T>) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut, E> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Context<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError> + 'static,
{
    async fn handle(&self, ctx: Context<T>) -> std::result::Result<(), HandlerError> {
        (self)(ctx).await.map_err(Into::into)
    }
}
