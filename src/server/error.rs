//! Error types for the server and for individual proxy sessions.

use std::io;
use thiserror::Error;

/// Fatal, server-wide errors. Any of these aborts [`listen`](crate::Server::listen).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The client-facing listener could not be bound.
    #[error("could not bind to {addr}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying socket error.
        source: io::Error,
    },
    /// The TLS certificate or private key could not be loaded.
    #[error("could not load TLS certificate or key")]
    Tls(#[source] io::Error),
    /// The configuration file could not be read.
    #[error("could not read configuration file")]
    ConfigRead(#[source] io::Error),
    /// The configuration file could not be parsed.
    #[error("could not parse configuration file")]
    ConfigParse(#[from] toml::de::Error),
}

/// Errors occurring on a single proxied connection. These terminate the
/// connection they belong to, never the server.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A command line had no alphabetic bytes to start from.
    #[error("wrong command line")]
    BadCommandLine,
    /// A control line exceeded the line length limit.
    #[error("line exceeds maximum length")]
    LineTooLong,
    /// The origin server could not be dialed or did not greet us.
    #[error("cannot connect to origin server {0}")]
    OriginUnreachable(String),
    /// The origin rejected an AUTH replay, so TLS cannot be established.
    #[error("origin server does not support TLS")]
    OriginNoTls,
    /// A second origin switch was requested on the same connection.
    #[error("origin already switched")]
    SwitchAlreadyDone,
    /// The middleware produced an empty origin address for the switch.
    #[error("user id not found")]
    UserNotFound,
    /// The origin went silent outside of a data transfer.
    #[error("origin connection timed out")]
    ProxyTimeout,
    /// A data transfer exceeded the configured transfer timeout.
    #[error("data transfer timed out")]
    TransferTimeout,
    /// A data endpoint could not be parsed from a command or reply.
    #[error("could not parse data endpoint: {0}")]
    DataParse(String),
    /// The proxy protocol preamble needs IPv4 addresses on both sides.
    #[error("only IPv4 is supported")]
    Ipv4Required,
    /// The origin closed its control connection.
    #[error("origin closed the connection")]
    OriginClosed,
    /// Any other socket level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

// Write failures against a peer that already hung up. These are expected
// during teardown and are logged at debug level only.
pub(crate) fn is_closed_write_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
