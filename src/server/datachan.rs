//! Contains code pertaining to the FTP *data* channel.
//!
//! When the data-channel proxy is enabled, every PASV/EPSV/PORT/EPRT from
//! the client gets a [`DataHandler`]: the proxy synthesizes its own
//! endpoint towards each side, rewrites the advertised address, and splices
//! the two sockets when the transfer starts.

use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::server::error::ProxyError;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

const DATA_TRANSFER_BUFFER_SIZE: usize = 4096;

/// Which data command established this cycle. The first two are client
/// active (the proxy dials the client), the last two client passive (the
/// client dials the proxy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataMode {
    Port,
    Eprt,
    Pasv,
    Epsv,
}

impl DataMode {
    pub(crate) fn is_passive(self) -> bool {
        matches!(self, DataMode::Pasv | DataMode::Epsv)
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DataMode::Port => "PORT",
            DataMode::Eprt => "EPRT",
            DataMode::Pasv => "PASV",
            DataMode::Epsv => "EPSV",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct DataState {
    // Passive modes: we listen towards the client, dial towards origin.
    client_listener: Option<TcpListener>,
    origin_addr: Option<SocketAddr>,
    // Active modes: we listen towards origin, dial towards the client.
    origin_listener: Option<TcpListener>,
    client_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

// One data command cycle. Only one may be in use per control connection at
// any time; `in_use` is the mutual exclusion token and `released` wakes
// whoever waits to replace the handler.
#[derive(Debug)]
pub(crate) struct DataHandler {
    mode: DataMode,
    listen_port: u16,
    transfer_timeout: u64,
    logger: slog::Logger,
    event_sink: Option<EventSink>,
    in_use: AtomicBool,
    released: Notify,
    in_data_transfer: Arc<AtomicBool>,
    state: Mutex<DataState>,
}

impl DataHandler {
    /// Handler for PASV/EPSV: binds the listener the client will be told to
    /// connect to. The origin endpoint is programmed later, from the 227 or
    /// 229 reply.
    pub(crate) async fn passive(
        mode: DataMode,
        config: &Config,
        logger: slog::Logger,
        event_sink: Option<EventSink>,
        in_data_transfer: Arc<AtomicBool>,
    ) -> Result<Arc<DataHandler>, ProxyError> {
        debug_assert!(mode.is_passive());
        let listener = bind_data_listener().await?;
        let listen_port = listener.local_addr()?.port();
        Ok(Arc::new(DataHandler {
            mode,
            listen_port,
            transfer_timeout: config.transfer_timeout,
            logger,
            event_sink,
            in_use: AtomicBool::new(false),
            released: Notify::new(),
            in_data_transfer,
            state: Mutex::new(DataState {
                client_listener: Some(listener),
                origin_addr: None,
                origin_listener: None,
                client_addr: None,
                task: None,
            }),
        }))
    }

    /// Handler for PORT/EPRT: remembers the endpoint the client advertised
    /// and binds the listener the origin will be told to connect to.
    pub(crate) async fn active(
        mode: DataMode,
        client_addr: SocketAddr,
        config: &Config,
        logger: slog::Logger,
        event_sink: Option<EventSink>,
        in_data_transfer: Arc<AtomicBool>,
    ) -> Result<Arc<DataHandler>, ProxyError> {
        debug_assert!(!mode.is_passive());
        let listener = bind_data_listener().await?;
        let listen_port = listener.local_addr()?.port();
        Ok(Arc::new(DataHandler {
            mode,
            listen_port,
            transfer_timeout: config.transfer_timeout,
            logger,
            event_sink,
            in_use: AtomicBool::new(false),
            released: Notify::new(),
            in_data_transfer,
            state: Mutex::new(DataState {
                client_listener: None,
                origin_addr: None,
                origin_listener: Some(listener),
                client_addr: Some(client_addr),
                task: None,
            }),
        }))
    }

    /// Port of whichever listener this handler bound.
    pub(crate) fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub(crate) fn mark_in_use(&self) {
        self.in_use.store(true, Ordering::SeqCst);
    }

    // Releases the mutual exclusion token and wakes a pending replacement.
    pub(crate) fn release(&self) {
        self.in_use.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Waits until the handler is no longer in use.
    pub(crate) async fn wait_released(&self) {
        loop {
            let released = self.released.notified();
            if !self.in_use.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    /// Programs the origin side endpoint parsed from a 227/229 reply.
    pub(crate) async fn set_origin_endpoint(&self, addr: SocketAddr) {
        self.state.lock().await.origin_addr = Some(addr);
    }

    /// Starts the transfer as its own task. Called by the reply pump right
    /// before the rewritten data command ack is forwarded, so the listener
    /// is accepting by the time the client sees the ack.
    pub(crate) async fn spawn_transfer(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move { handler.run_transfer().await });
        self.state.lock().await.task = Some(task);
    }

    async fn run_transfer(self: Arc<Self>) {
        self.in_data_transfer.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(self.transfer_timeout), self.transfer()).await;
        self.in_data_transfer.store(false, Ordering::SeqCst);

        match result {
            Ok(Ok((src_addr, dst_addr, bytes))) => {
                slog::debug!(self.logger, "data transfer done: {} -> {} ({} bytes)", src_addr, dst_addr, bytes);
                if let Some(sink) = &self.event_sink {
                    sink.publish(&self.logger, Event::DataTransfer { src_addr, dst_addr, bytes });
                }
            }
            Ok(Err(err)) => {
                slog::warn!(self.logger, "data transfer failed: {}", err);
            }
            Err(_) => {
                slog::warn!(self.logger, "data transfer failed: {}", ProxyError::TransferTimeout);
            }
        }

        self.release();
    }

    async fn transfer(&self) -> Result<(String, String, u64), ProxyError> {
        let (mut client, mut origin) = self.establish().await?;
        let src_addr = client.peer_addr()?.to_string();
        let dst_addr = origin.peer_addr()?.to_string();

        let bytes = AtomicU64::new(0);
        {
            let (client_read, client_write) = client.split();
            let (origin_read, origin_write) = origin.split();
            let upstream = copy_counted(client_read, origin_write, &bytes);
            let downstream = copy_counted(origin_read, client_write, &bytes);
            tokio::pin!(upstream, downstream);
            // Either side closing ends the cycle; the other socket is closed
            // when the streams drop below.
            tokio::select! {
                result = &mut upstream => result?,
                result = &mut downstream => result?,
            }
        }

        Ok((src_addr, dst_addr, bytes.into_inner()))
    }

    async fn establish(&self) -> Result<(TcpStream, TcpStream), ProxyError> {
        let (listener, dial_addr) = {
            let mut state = self.state.lock().await;
            match self.mode {
                DataMode::Pasv | DataMode::Epsv => {
                    let listener = state
                        .client_listener
                        .take()
                        .ok_or_else(|| ProxyError::DataParse("data cycle already consumed".to_string()))?;
                    let addr = state
                        .origin_addr
                        .ok_or_else(|| ProxyError::DataParse("origin data endpoint not programmed".to_string()))?;
                    (listener, addr)
                }
                DataMode::Port | DataMode::Eprt => {
                    let listener = state
                        .origin_listener
                        .take()
                        .ok_or_else(|| ProxyError::DataParse("data cycle already consumed".to_string()))?;
                    let addr = state
                        .client_addr
                        .ok_or_else(|| ProxyError::DataParse("client data endpoint not programmed".to_string()))?;
                    (listener, addr)
                }
            }
        };

        let (accepted, peer) = listener.accept().await?;
        slog::debug!(self.logger, "accepted {} data connection from {}", self.mode, peer);
        let dialed = TcpStream::connect(dial_addr).await?;

        match self.mode {
            DataMode::Pasv | DataMode::Epsv => Ok((accepted, dialed)),
            DataMode::Port | DataMode::Eprt => Ok((dialed, accepted)),
        }
    }

    /// Tears the cycle down: aborts a running transfer and drops whatever
    /// listener is still bound.
    pub(crate) async fn close(&self) {
        let task = {
            let mut state = self.state.lock().await;
            state.client_listener = None;
            state.origin_listener = None;
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.in_data_transfer.store(false, Ordering::SeqCst);
        self.release();
    }
}

// Data listeners serve both address families where the platform allows, so
// EPSV and EPRT stay usable for IPv6 clients. Falls back to a plain IPv4
// wildcard when IPv6 is unavailable.
async fn bind_data_listener() -> io::Result<TcpListener> {
    match dual_stack_socket() {
        Ok(listener) => TcpListener::from_std(listener),
        Err(_) => TcpListener::bind("0.0.0.0:0").await,
    }
}

fn dual_stack_socket() -> io::Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

async fn copy_counted<R, W>(mut from: R, mut to: W, bytes: &AtomicU64) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; DATA_TRANSFER_BUFFER_SIZE];
    loop {
        let n = from.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buffer[..n]).await?;
        bytes.fetch_add(n as u64, Ordering::SeqCst);
    }
    let _ = to.shutdown().await;
    Ok(())
}

/// Parses the parenthesized group of a `227 Entering Passive Mode
/// (h1,h2,h3,h4,p1,p2)` reply.
pub(crate) fn parse_pasv_reply(line: &str) -> Result<SocketAddrV4, ProxyError> {
    let bad = |line: &str| ProxyError::DataParse(format!("bad PASV reply: {}", line.trim_end()));
    let start = line.find('(').ok_or_else(|| bad(line))?;
    let end = line[start..].find(')').map(|i| start + i).ok_or_else(|| bad(line))?;
    let mut octets = line[start + 1..end].split(',').map(str::trim);

    let mut next = |max: u16| -> Result<u16, ProxyError> {
        let value: u16 = octets.next().ok_or_else(|| bad(line))?.parse().map_err(|_| bad(line))?;
        if value > max {
            return Err(bad(line));
        }
        Ok(value)
    };
    let (h1, h2, h3, h4) = (next(255)?, next(255)?, next(255)?, next(255)?);
    let (p1, p2) = (next(255)?, next(255)?);
    if octets.next().is_some() {
        return Err(bad(line));
    }

    let ip = Ipv4Addr::new(h1 as u8, h2 as u8, h3 as u8, h4 as u8);
    Ok(SocketAddrV4::new(ip, p1 * 256 + p2))
}

/// Parses the `(|||port|)` group of a `229 Entering Extended Passive Mode`
/// reply.
pub(crate) fn parse_epsv_reply(line: &str) -> Result<u16, ProxyError> {
    let bad = |line: &str| ProxyError::DataParse(format!("bad EPSV reply: {}", line.trim_end()));
    let start = line.find('(').ok_or_else(|| bad(line))?;
    let end = line[start..].find(')').map(|i| start + i).ok_or_else(|| bad(line))?;
    let fields: Vec<&str> = line[start + 1..end].split('|').collect();
    if fields.len() != 5 {
        return Err(bad(line));
    }
    fields[3].trim().parse().map_err(|_| bad(line))
}

/// Parses a `PORT h1,h2,h3,h4,p1,p2` argument.
pub(crate) fn parse_port_arg(arg: &str) -> Result<SocketAddrV4, ProxyError> {
    // Same shape as the PASV group, just without the parentheses.
    parse_pasv_reply(&format!("({})", arg.trim()))
        .map_err(|_| ProxyError::DataParse(format!("bad PORT argument: {}", arg.trim())))
}

/// Parses an `EPRT |proto|addr|port|` argument (RFC 2428).
pub(crate) fn parse_eprt_arg(arg: &str) -> Result<SocketAddr, ProxyError> {
    let bad = |arg: &str| ProxyError::DataParse(format!("bad EPRT argument: {}", arg.trim()));
    let arg = arg.trim();
    let delimiter = arg.chars().next().ok_or_else(|| bad(arg))?;
    let fields: Vec<&str> = arg.split(delimiter).collect();
    if fields.len() != 5 {
        return Err(bad(arg));
    }
    let ip: IpAddr = match fields[1] {
        "1" => fields[2].parse::<Ipv4Addr>().map_err(|_| bad(arg))?.into(),
        "2" => fields[2].parse::<std::net::Ipv6Addr>().map_err(|_| bad(arg))?.into(),
        _ => return Err(bad(arg)),
    };
    let port: u16 = fields[3].parse().map_err(|_| bad(arg))?;
    Ok(SocketAddr::new(ip, port))
}

/// Formats the rewritten 227 reply advertising the masquerade address and a
/// proxy listener port.
pub(crate) fn format_pasv_reply(masquerade_ip: Ipv4Addr, port: u16) -> String {
    let octets = masquerade_ip.octets();
    format!(
        "227 Entering Passive Mode ({},{},{},{},{},{}).\r\n",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        port / 256,
        port % 256
    )
}

/// Formats the rewritten 229 reply advertising a proxy listener port.
pub(crate) fn format_epsv_reply(port: u16) -> String {
    format!("229 Entering Extended Passive Mode (|||{}|).\r\n", port)
}

/// Formats a PORT argument for the proxy's origin-facing listener.
pub(crate) fn format_port_arg(ip: Ipv4Addr, port: u16) -> String {
    let octets = ip.octets();
    format!("{},{},{},{},{},{}", octets[0], octets[1], octets[2], octets[3], port / 256, port % 256)
}

/// Formats an EPRT argument for the proxy's origin-facing listener.
pub(crate) fn format_eprt_arg(addr: SocketAddr) -> String {
    let proto = if addr.is_ipv4() { 1 } else { 2 };
    format!("|{}|{}|{}|", proto, addr.ip(), addr.port())
}

/// Formats the ack forwarded to the client for an active mode data command.
pub(crate) fn format_data_ack(mode: DataMode) -> String {
    format!("200 {} command successful.\r\n", mode)
}
