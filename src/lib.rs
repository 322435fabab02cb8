#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod error;
pub mod log;
pub mod router;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use client::{Client, ClientError};
pub use router::{Context, Router};
pub use ws::config::{Config, ReconnectConfig};
pub use ws::{ConnectionEvent, ConnectionManager, ConnectionSnapshot, ConnectionStatus};
