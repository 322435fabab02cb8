//! Schema-based routing of inbound payloads to concurrently executed handlers.
//!
//! Each registration pairs a [`Schema`] with a [`Handler`]. A payload is decoded once, offered
//! to every registration in registration order, and every registration whose schema accepts it
//! gets its own task. A failing or panicking handler is reported on [`Router::errors`] and never
//! affects its siblings.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use resilient_ws::error::HandlerError;
//! use resilient_ws::router::{Context, MessageSink, Router, schema};
//! use resilient_ws::ws::ConnectionSnapshot;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Trade {
//!     price: f64,
//! }
//!
//! struct Discard;
//!
//! #[async_trait]
//! impl MessageSink for Discard {
//!     async fn send(&self, _data: Vec<u8>) -> bool {
//!         false
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new();
//! router.register(schema::tagged::<Trade>("type", "trade"), |ctx: Context<Trade>| async move {
//!     println!("trade at {}", ctx.value.price);
//!     Ok::<_, HandlerError>(())
//! });
//!
//! let snapshot = ConnectionSnapshot::idle("wss://example.com".parse()?);
//! let outcome = router
//!     .dispatch(&br#"{"type":"trade","price":0.5}"#[..], Arc::new(Discard), snapshot)
//!     .await;
//! assert_eq!(outcome.matched, 1);
//! # Ok(())
//! # }
//! ```

mod handler;
pub mod schema;

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tokio::sync::broadcast;

pub use handler::{Context, Handler};
pub use schema::Schema;

use crate::error::{Error, HandlerError, Kind};
use crate::log::{Logger, default_logger};
use crate::ws::ConnectionSnapshot;

/// Broadcast channel capacity for dispatch errors.
const BROADCAST_CAPACITY: usize = 1024;

/// Send capability handed to handlers through their [`Context`].
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Send `data`, returning `false` when it could not be handed to an open session.
    async fn send(&self, data: Vec<u8>) -> bool;
}

/// Why a dispatch reported an error.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DispatchErrorCause {
    /// The payload was not valid JSON; no handler ran
    #[strum(serialize = "decode failure")]
    DecodeFailure,
    /// A handler returned an error or panicked
    #[strum(serialize = "handler failure")]
    HandlerFailure,
}

/// A failure observed while dispatching one payload.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub cause: DispatchErrorCause,
    pub error: Arc<Error>,
    /// The payload being dispatched
    pub raw: Arc<[u8]>,
    /// Index of the failing registration, for handler failures
    pub registration: Option<usize>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.registration {
            Some(index) => write!(f, "{} in registration {index}: {}", self.cause, self.error),
            None => write!(f, "{}: {}", self.cause, self.error),
        }
    }
}

impl StdError for DispatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Summary of one [`Router::dispatch`] call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Registrations whose schema accepted the payload
    pub matched: usize,
    /// Matched handlers that returned an error or panicked
    pub failed: usize,
}

trait Route: Send + Sync + 'static {
    fn route(
        &self,
        value: &Value,
        raw: &Arc<[u8]>,
        connection: &ConnectionSnapshot,
        sink: &Arc<dyn MessageSink>,
    ) -> Option<BoxFuture<'static, Result<(), HandlerError>>>;
}

struct Registration<S, H> {
    schema: S,
    handler: Arc<H>,
}

impl<S, H> Route for Registration<S, H>
where
    S: Schema,
    H: Handler<S::Output>,
{
    fn route(
        &self,
        value: &Value,
        raw: &Arc<[u8]>,
        connection: &ConnectionSnapshot,
        sink: &Arc<dyn MessageSink>,
    ) -> Option<BoxFuture<'static, Result<(), HandlerError>>> {
        let value = self.schema.validate(value)?;
        let ctx = Context::new(value, Arc::clone(raw), connection.clone(), Arc::clone(sink));
        let handler = Arc::clone(&self.handler);

        Some(Box::pin(async move { handler.handle(ctx).await }))
    }
}

/// Ordered set of schema/handler registrations.
pub struct Router {
    routes: RwLock<Vec<Arc<dyn Route>>>,
    errors_tx: broadcast::Sender<DispatchError>,
    logger: Arc<dyn Logger>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("registrations", &self.len())
            .finish_non_exhaustive()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::with_logger(default_logger())
    }

    #[must_use]
    pub fn with_logger(logger: Arc<dyn Logger>) -> Self {
        let (errors_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            routes: RwLock::new(Vec::new()),
            errors_tx,
            logger,
        }
    }

    /// Append a registration. Registrations are never removed and are tried in the order added.
    pub fn register<S, H>(&self, schema: S, handler: H) -> &Self
    where
        S: Schema,
        H: Handler<S::Output>,
    {
        let route: Arc<dyn Route> = Arc::new(Registration {
            schema,
            handler: Arc::new(handler),
        });
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to decode and handler failures.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<DispatchError> {
        self.errors_tx.subscribe()
    }

    /// Decode `raw`, run every matching handler concurrently and wait for all of them.
    ///
    /// Failures are logged and published on [`Self::errors`]; they are never returned.
    pub async fn dispatch<R: Into<Arc<[u8]>>>(
        &self,
        raw: R,
        sink: Arc<dyn MessageSink>,
        connection: ConnectionSnapshot,
    ) -> Dispatched {
        let raw: Arc<[u8]> = raw.into();

        let value = match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => value,
            Err(e) => {
                self.logger.warn(
                    "dropping undecodable payload",
                    Some(&json!({ "error": e.to_string(), "len": raw.len() })),
                );
                self.report(DispatchError {
                    cause: DispatchErrorCause::DecodeFailure,
                    error: Arc::new(Error::with_source(Kind::Decode, e)),
                    raw,
                    registration: None,
                });
                return Dispatched::default();
            }
        };

        let routes = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let tasks: Vec<_> = routes
            .iter()
            .enumerate()
            .filter_map(|(index, route)| {
                route
                    .route(&value, &raw, &connection, &sink)
                    .map(|handler| (index, tokio::spawn(handler)))
            })
            .collect();

        let matched = tasks.len();
        if matched == 0 {
            self.logger.debug(
                "no registration matched payload",
                Some(&json!({ "registrations": routes.len() })),
            );
            return Dispatched::default();
        }

        let outcomes = join_all(
            tasks
                .into_iter()
                .map(|(index, task)| async move { (index, task.await) }),
        )
        .await;

        let mut failed = 0;
        for (index, outcome) in outcomes {
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => Error::handler(e),
                Err(e) => match e.try_into_panic() {
                    Ok(payload) => Error::handler_panicked(panic_message(payload)),
                    Err(e) => Error::handler_panicked(e.to_string()),
                },
            };

            failed += 1;
            self.logger.error(
                "handler failed",
                Some(&json!({ "registration": index, "error": error.to_string() })),
            );
            self.report(DispatchError {
                cause: DispatchErrorCause::HandlerFailure,
                error: Arc::new(error),
                raw: Arc::clone(&raw),
                registration: Some(index),
            });
        }

        Dispatched { matched, failed }
    }

    fn report(&self, error: DispatchError) {
        _ = self.errors_tx.send(error);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "non-string panic payload".to_owned(), |s| (*s).to_owned()),
    }
}
