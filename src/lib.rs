#![deny(missing_docs)]
//! A user-routed FTP(S) reverse proxy library for Rust
//!
//! ftpgate accepts FTP control connections, picks a backing origin server
//! through an application-supplied middleware evaluated during
//! authentication, and relays the control dialog (and, optionally, the data
//! dialog) between the two sides. It speaks FTP at the wire level: it
//! enforces command line shape, terminates or re-negotiates explicit TLS,
//! emits the PROXY protocol v1 preamble towards origins, and can masquerade
//! the data channel so PASV/EPSV/PORT/EPRT transfers traverse the proxy.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ftpgate::{Config, Server};
//!
//! # async fn run() -> Result<(), ftpgate::ServerError> {
//! let config = Config::load("./config.toml")?;
//! let (events, mut event_rx) = ftpgate::event_channel(64);
//! tokio::spawn(async move {
//!     while let Some(event) = event_rx.recv().await {
//!         println!("{}: {:?}", event.name(), event);
//!     }
//! });
//!
//! Server::new(config).event_sink(events).listen().await
//! # }
//! ```

pub mod config;
pub mod events;
pub mod middleware;
pub(crate) mod server;

pub use crate::config::{Config, TlsPair};
pub use crate::events::{event_channel, Event, EventError, EventReceiver, EventSink};
pub use crate::middleware::{Context, Middleware, MiddlewareError, MiddlewareFuture};
pub use crate::server::controlchan::reply::Reply;
pub use crate::server::error::{ProxyError, ServerError};
pub use crate::server::tls::TlsVersion;
pub use crate::server::Server;
