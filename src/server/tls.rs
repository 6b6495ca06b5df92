//! TLS plumbing for both sides of the proxy: the client-facing acceptor
//! built from the configured PEM pair, and the origin-facing connector used
//! when AUTH commands are replayed after a switch.

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, ServerConfig, ServerName};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// A TLS protocol version negotiated on the control channel.
///
/// The client, the proxy and the origin must end up on the same version, so
/// the version negotiated with the client is pinned as both minimum and
/// maximum when the proxy later handshakes with an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    pub(crate) fn from_protocol(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    fn supported(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static TLS12: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
        static TLS13: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];
        match self {
            TlsVersion::Tls12 => &TLS12,
            TlsVersion::Tls13 => &TLS13,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

pub(crate) fn server_config<P: AsRef<Path>>(certs_file: P, key_file: P) -> io::Result<Arc<ServerConfig>> {
    let certs: Vec<Certificate> = load_certs(certs_file)?;
    let privkey: PrivateKey = load_private_key(key_file)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, privkey)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    Ok(Arc::new(config))
}

// Client config for the origin side. The version is pinned to what the
// client negotiated and certificate verification is disabled: the origin is
// picked by the operator's own routing hook, not by the end user.
pub(crate) fn origin_config(version: TlsVersion) -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(version.supported())
        .expect("pinned protocol version is supported")
        .with_custom_certificate_verifier(Arc::new(DisabledVerifier))
        .with_no_client_auth();
    Arc::new(config)
}

pub(crate) fn origin_server_name(host: &str) -> Result<ServerName, io::Error> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip));
    }
    ServerName::try_from(host).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn load_certs<P: AsRef<Path>>(filename: P) -> io::Result<Vec<Certificate>> {
    let certfile: File = File::open(filename)?;
    let mut reader: BufReader<File> = BufReader::new(certfile);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no certificate found"));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key<P: AsRef<Path>>(filename: P) -> io::Result<PrivateKey> {
    let rsa_keys = {
        let keyfile = File::open(&filename)?;
        let mut reader = BufReader::new(keyfile);
        rustls_pemfile::rsa_private_keys(&mut reader)?
    };

    let pkcs8_keys = {
        let keyfile = File::open(&filename)?;
        let mut reader = BufReader::new(keyfile);
        rustls_pemfile::pkcs8_private_keys(&mut reader)?
    };

    // prefer to load pkcs8 keys
    let key = if let Some(key) = pkcs8_keys.into_iter().next() {
        key
    } else {
        rsa_keys
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found"))?
    };

    Ok(PrivateKey(key))
}

struct DisabledVerifier;

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mapping_round_trips() {
        assert_eq!(TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_2), Some(TlsVersion::Tls12));
        assert_eq!(TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_3), Some(TlsVersion::Tls13));
        assert_eq!(TlsVersion::from_protocol(rustls::ProtocolVersion::TLSv1_1), None);
    }

    #[test]
    fn server_name_accepts_hosts_and_addresses() {
        assert!(matches!(origin_server_name("10.0.0.7").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(origin_server_name("ftp.example.com").unwrap(), ServerName::DnsName(_)));
        assert!(origin_server_name("not a hostname").is_err());
    }
}
