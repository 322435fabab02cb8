//! Connection management over a message-oriented duplex transport.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns one transport session at a time, with heartbeat, backoff
//!   reconnection, endpoint failover and query-parameter reconfiguration
//! - [`Transport`]/[`Session`]: the capability the manager drives; [`WsTransport`] is the
//!   `tokio-tungstenite` implementation (feature `ws`)
//! - [`config::Config`]: endpoints, overlay, heartbeat and [`config::ReconnectConfig`]
//!
//! # Example
//!
//! ```ignore
//! let config = Config::builder().endpoints(endpoints).build();
//! let connection = ConnectionManager::new(config)?;
//! connection.connect();
//! connection.update_params([("token", "abc")]);
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod params;
pub mod transport;

pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionStatus, Outbound,
};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use params::ParamValue;
#[cfg(feature = "ws")]
pub use transport::WsTransport;
pub use transport::{Session, Transport, TransportEvent};
