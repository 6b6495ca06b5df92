//! Per-connection session state.

use crate::server::datachan::DataMode;
use crate::server::tls::TlsVersion;

use std::fmt::Formatter;
use std::net::SocketAddr;
use std::sync::Arc;

// TraceId correlates the log statements of one client connection.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub(crate) struct TraceId(u64);

impl TraceId {
    pub(crate) fn new() -> Self {
        TraceId(rand::random())
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// The session shared via an asynchronous lock between the command pump, the
// reply pump and the switch path.
pub(crate) type SharedSession = Arc<tokio::sync::Mutex<Session>>;

#[derive(Debug)]
pub(crate) struct Session {
    pub source: SocketAddr,
    pub trace_id: TraceId,
    // The username from the USER command. None before identification.
    pub auth_user: Option<String>,
    // Where the next origin switch should go, as decided by middleware.
    // None means the currently bound origin stays in effect.
    pub next_origin_addr: Option<String>,
    // TLS version negotiated with the client, pinned for the origin side.
    pub tls_protocol: Option<TlsVersion>,
    // AUTH/PBSZ/PROT lines accepted from the client, in order, for replay
    // against a freshly bound origin.
    pub previous_tls_commands: Vec<String>,
    // Set while a PASV/EPSV/PORT/EPRT awaits its reply from origin, so the
    // reply pump knows which reply is a data command ack.
    pub pending_data_cmd: Option<DataMode>,
}

impl Session {
    pub(crate) fn new(source: SocketAddr) -> Self {
        Session {
            source,
            trace_id: TraceId::new(),
            auth_user: None,
            next_origin_addr: None,
            tls_protocol: None,
            previous_tls_commands: Vec::new(),
            pending_data_cmd: None,
        }
    }
}
