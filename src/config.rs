//! Server configuration.
//!
//! A [`Config`] can be built in code or loaded from a TOML file with
//! [`Config::load`]. Missing keys fall back to the defaults listed per
//! field.

use crate::server::error::ServerError;
use crate::server::tls;

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Paths to the PEM encoded certificate chain and private key enabling
/// client-facing FTPS via `AUTH TLS`.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsPair {
    /// Path to the certificate chain file.
    pub cert: PathBuf,
    /// Path to the private key file (PKCS#8 or RSA).
    pub key: PathBuf,
}

/// The proxy configuration record.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bind address for the client-facing listener. Default `0.0.0.0:2121`.
    pub listen_addr: String,
    /// Default origin `host:port`, used until a switch rebinds the
    /// connection. Default `127.0.0.1:21`.
    pub remote_addr: String,
    /// Seconds of client inactivity before the connection is closed.
    /// Default 900.
    pub idle_timeout: u64,
    /// Seconds of origin inactivity tolerated while no data transfer is in
    /// progress. 0 disables the deadline. Default 900.
    pub proxy_timeout: u64,
    /// Seconds bounding a single data transfer end-to-end. Default 900.
    pub transfer_timeout: u64,
    /// TCP keepalive period in seconds for origin and client sockets.
    /// Default 60.
    pub keepalive_time: u64,
    /// Hard cap on concurrent client connections; 0 means unlimited.
    pub max_connections: i32,
    /// Text appended after `220 ` in the proxy-issued banner.
    pub welcome_msg: String,
    /// TLS keypair; enables client-facing FTPS.
    pub tls: Option<TlsPair>,
    /// Emit the PROXY protocol v1 preamble to origins.
    pub proxy_protocol: bool,
    /// Intercept PASV/EPSV/PORT/EPRT so data connections traverse the
    /// proxy.
    pub data_chan_proxy: bool,
    /// IPv4 address advertised in rewritten PASV replies.
    pub masquerade_ip: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:2121".to_string(),
            remote_addr: "127.0.0.1:21".to_string(),
            idle_timeout: 900,
            proxy_timeout: 900,
            transfer_timeout: 900,
            keepalive_time: 60,
            max_connections: 0,
            welcome_msg: "Welcome to ftpgate".to_string(),
            tls: None,
            proxy_protocol: false,
            data_chan_proxy: false,
            masquerade_ip: None,
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file. When a TLS keypair is
    /// configured it is loaded here as well, so a broken keypair fails at
    /// startup instead of on the first `AUTH TLS`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ServerError> {
        let raw = std::fs::read_to_string(path).map_err(ServerError::ConfigRead)?;
        let config: Config = toml::from_str(&raw)?;
        if let Some(pair) = &config.tls {
            tls::server_config(&pair.cert, &pair.key).map_err(ServerError::Tls)?;
        }
        Ok(config)
    }
}
