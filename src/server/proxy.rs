//! The origin side of a proxied connection.
//!
//! A [`ProxyServer`] owns the socket to the currently bound origin. Its
//! reply pump reads origin replies, applies the rewrite rules (welcome
//! banner, `500 PROXY` tolerance, data channel interception) and forwards
//! them to the client in order. Mid-session the origin can be switched
//! exactly once: the pump is parked on a rendezvous, the old socket is
//! closed, the new origin is dialed and the recorded TLS commands are
//! replayed before the pump resumes.

use crate::config::Config;
use crate::server::chancomms::{ControlChanMsg, ControlChanSender, PumpChannels};
use crate::server::controlchan::codecs::{ReplyBlock, ReplyCodec};
use crate::server::controlchan::line_parser;
use crate::server::datachan::{self, DataHandler, DataMode};
use crate::server::error::{is_closed_write_error, ProxyError};
use crate::server::session::SharedSession;
use crate::server::stream::{BoxedStream, StreamReadHalf, StreamWriteHalf};
use crate::server::tls;

use bytes::Bytes;
use futures_util::StreamExt;
use proxy_protocol::{version1::ProxyAddresses, ProxyHeader};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;

const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MAX_HANDSHAKE_LINE: usize = 4096;

pub(crate) type ReplyReader = FramedRead<StreamReadHalf, ReplyCodec>;
pub(crate) type SharedClientWriter = Arc<Mutex<Option<StreamWriteHalf>>>;

// How one run of the reply pump ended.
pub(crate) enum PumpExit {
    // Parked on the stop rendezvous; a switch (or teardown) is in progress.
    Stopped,
    // The origin closed its control connection.
    Closed,
    // A read or write failed.
    Failed(ProxyError),
}

pub(crate) struct ProxyServer {
    config: Arc<Config>,
    logger: slog::Logger,
    session: SharedSession,
    client_addr: SocketAddr,
    client_writer: SharedClientWriter,
    origin_reader: Mutex<Option<ReplyReader>>,
    origin_writer: Mutex<Option<StreamWriteHalf>>,
    origin_addr: StdMutex<String>,
    origin_local_ip: StdMutex<IpAddr>,
    origin_peer_ip: StdMutex<IpAddr>,
    // Gate on the reply pump: while false, replies are withheld from the
    // client so proxy-issued replies cannot interleave with origin output.
    pass_through: AtomicBool,
    stop: AtomicBool,
    is_switched: AtomicBool,
    welcome: String,
    in_data_transfer: Arc<AtomicBool>,
    data_handler: Mutex<Option<Arc<DataHandler>>>,
    stop_tx: mpsc::Sender<()>,
    stop_done_rx: Mutex<mpsc::Receiver<()>>,
    switch_tx: mpsc::Sender<bool>,
    control_tx: ControlChanSender,
}

impl ProxyServer {
    /// Dials the default origin and builds the proxy half of a client
    /// connection. The returned channels belong to the pump runner task.
    pub(crate) async fn connect(
        config: Arc<Config>,
        logger: slog::Logger,
        session: SharedSession,
        client_writer: SharedClientWriter,
        in_data_transfer: Arc<AtomicBool>,
        control_tx: ControlChanSender,
    ) -> Result<(Arc<ProxyServer>, PumpChannels), ProxyError> {
        let client_addr = { session.lock().await.source };
        let origin_addr = config.remote_addr.clone();
        let stream = dial_origin(&origin_addr, config.keepalive_time).await?;
        let local_ip = stream.local_addr()?.ip();
        let peer_ip = stream.peer_addr()?.ip();
        slog::debug!(logger, "new proxy from={} to={}", stream.local_addr()?, stream.peer_addr()?);

        let mut stream: BoxedStream = Box::new(stream);
        if config.proxy_protocol {
            slog::debug!(logger, "send proxy protocol to origin");
            send_proxy_header(&mut stream, client_addr, &origin_addr).await?;
        }
        let (read_half, write_half) = tokio::io::split(stream);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (stop_done_tx, stop_done_rx) = mpsc::channel(1);
        let (switch_tx, switch_rx) = mpsc::channel(1);
        let welcome = format!("220 {}\r\n", config.welcome_msg);

        let proxy = Arc::new(ProxyServer {
            config,
            logger,
            session,
            client_addr,
            client_writer,
            origin_reader: Mutex::new(Some(FramedRead::new(read_half, ReplyCodec::new()))),
            origin_writer: Mutex::new(Some(write_half)),
            origin_addr: StdMutex::new(origin_addr),
            origin_local_ip: StdMutex::new(local_ip),
            origin_peer_ip: StdMutex::new(peer_ip),
            pass_through: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            is_switched: AtomicBool::new(false),
            welcome,
            in_data_transfer,
            data_handler: Mutex::new(None),
            stop_tx,
            stop_done_rx: Mutex::new(stop_done_rx),
            switch_tx,
            control_tx,
        });

        Ok((
            proxy,
            PumpChannels {
                stop_rx,
                stop_done_tx,
                switch_rx,
            },
        ))
    }

    pub(crate) fn is_switched(&self) -> bool {
        self.is_switched.load(Ordering::SeqCst)
    }

    pub(crate) fn current_origin_addr(&self) -> String {
        self.origin_addr.lock().expect("origin addr lock").clone()
    }

    // The proxy's address as the origin sees it; advertised in rewritten
    // PORT/EPRT arguments.
    pub(crate) fn origin_local_ip(&self) -> IpAddr {
        *self.origin_local_ip.lock().expect("origin local ip lock")
    }

    fn origin_peer_ip(&self) -> IpAddr {
        *self.origin_peer_ip.lock().expect("origin peer ip lock")
    }

    /// Normalizes a command line and writes it to the origin.
    pub(crate) async fn send_to_origin(&self, line: &str) -> Result<(), ProxyError> {
        let line = line_parser::normalize_command_line(line)?;
        slog::debug!(self.logger, "send to origin: {}", line_parser::redact(&line));

        let mut guard = self.origin_writer.lock().await;
        let writer = guard.as_mut().ok_or(ProxyError::OriginClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Installs a new data handler. Only one data connection may be live at
    /// a time: an in-use predecessor is awaited, then closed.
    pub(crate) async fn set_data_handler(&self, handler: Arc<DataHandler>) {
        let mut slot = self.data_handler.lock().await;
        if let Some(previous) = slot.take() {
            previous.wait_released().await;
            previous.close().await;
        }
        handler.mark_in_use();
        *slot = Some(handler);
    }

    pub(crate) async fn close_data_handler(&self) {
        if let Some(handler) = self.data_handler.lock().await.take() {
            handler.close().await;
        }
    }

    fn suspend(&self) {
        slog::debug!(self.logger, "suspend proxy");
        self.pass_through.store(false, Ordering::SeqCst);
    }

    fn unsuspend(&self) {
        slog::debug!(self.logger, "unsuspend proxy");
        self.pass_through.store(true, Ordering::SeqCst);
    }

    /// Atomically replaces the bound origin. Allowed at most once per
    /// connection; any failure is terminal for the connection.
    pub(crate) async fn switch_origin(&self, new_addr: &str) -> Result<(), ProxyError> {
        if new_addr.is_empty() {
            return Err(ProxyError::UserNotFound);
        }
        if self.is_switched.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::SwitchAlreadyDone);
        }

        slog::info!(self.logger, "switch origin to: {}", new_addr);

        let was_pass_through = self.pass_through.load(Ordering::SeqCst);
        if was_pass_through {
            self.suspend();
        }

        // Park the reply pump. After the acknowledgement the old origin
        // socket is exclusively ours.
        let _ = self.stop_tx.send(()).await;
        let _ = self.stop_done_rx.lock().await.recv().await;

        let result = self.rebind_origin(new_addr).await;

        self.stop.store(false, Ordering::SeqCst);
        if was_pass_through {
            self.unsuspend();
        }
        // The pump runner restarts the pump on success and exits otherwise.
        let _ = self.switch_tx.send(result.is_ok()).await;

        result
    }

    async fn rebind_origin(&self, new_addr: &str) -> Result<(), ProxyError> {
        // Drop what remains of the old origin connection.
        self.origin_writer.lock().await.take();
        self.origin_reader.lock().await.take();

        let stream = dial_origin(new_addr, self.config.keepalive_time).await?;
        let local_ip = stream.local_addr()?.ip();
        let peer_ip = stream.peer_addr()?.ip();
        let mut stream: BoxedStream = Box::new(stream);

        if self.config.proxy_protocol {
            slog::debug!(self.logger, "send proxy protocol to origin");
            send_proxy_header(&mut stream, self.client_addr, new_addr).await?;
        }

        // The new origin greets like any FTP server; the client already has
        // its banner, so the greeting is consumed here.
        let mut greeting = read_line(&mut stream).await?;
        while self.config.proxy_protocol && greeting.starts_with("500 PROXY") {
            greeting = read_line(&mut stream).await?;
        }
        slog::debug!(self.logger, "response from new origin: {}", greeting.trim_end());
        if !greeting.starts_with('2') {
            return Err(ProxyError::OriginUnreachable(new_addr.to_string()));
        }

        *self.origin_addr.lock().expect("origin addr lock") = new_addr.to_string();
        let stream = self.replay_tls_commands(stream).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.origin_reader.lock().await = Some(FramedRead::new(read_half, ReplyCodec::new()));
        *self.origin_writer.lock().await = Some(write_half);
        *self.origin_local_ip.lock().expect("origin local ip lock") = local_ip;
        *self.origin_peer_ip.lock().expect("origin peer ip lock") = peer_ip;
        Ok(())
    }

    // Replays the AUTH/PBSZ/PROT sequence recorded from the client against a
    // freshly bound origin. A 234 on AUTH upgrades the origin socket to TLS
    // using exactly the version the client negotiated.
    async fn replay_tls_commands(&self, mut stream: BoxedStream) -> Result<BoxedStream, ProxyError> {
        let (tls_protocol, commands) = {
            let session = self.session.lock().await;
            (session.tls_protocol, session.previous_tls_commands.clone())
        };

        for command in commands {
            slog::debug!(self.logger, "replay to origin: {}", line_parser::redact(&command));
            stream.write_all(command.as_bytes()).await?;
            stream.flush().await?;

            let (verb, _) = line_parser::parse_command(&command);
            let mut response = read_line(&mut stream).await?;
            while self.config.proxy_protocol && response.starts_with("500 PROXY") {
                response = read_line(&mut stream).await?;
            }
            slog::debug!(self.logger, "response from origin: {}", response.trim_end());

            if verb == "AUTH" {
                match line_parser::parse_reply_code(response.as_bytes()) {
                    Some((234, _)) => {
                        let version = tls_protocol.ok_or(ProxyError::OriginNoTls)?;
                        let host = host_part(&self.current_origin_addr());
                        let server_name = tls::origin_server_name(&host)?;
                        let connector = TlsConnector::from(tls::origin_config(version));
                        let tls_stream = connector.connect(server_name, stream).await?;
                        stream = Box::new(tls_stream);
                        slog::debug!(self.logger, "TLS connection to origin established");
                    }
                    _ => return Err(ProxyError::OriginNoTls),
                }
            }
        }

        Ok(stream)
    }

    // One run of the reply pump: reads origin replies until the connection
    // ends or the stop rendezvous fires.
    pub(crate) async fn response_proxy(&self, stop_rx: &mut mpsc::Receiver<()>, stop_done_tx: &mpsc::Sender<()>) -> PumpExit {
        let mut reader = match self.origin_reader.lock().await.take() {
            Some(reader) => reader,
            None => {
                return PumpExit::Failed(ProxyError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "origin reader not installed",
                )))
            }
        };
        let mut withheld: Vec<Bytes> = Vec::new();

        enum PumpEvent {
            Stop,
            Reply(Result<Option<ReplyBlock>, ProxyError>),
        }

        loop {
            let event = tokio::select! {
                _ = stop_rx.recv() => PumpEvent::Stop,
                item = self.next_reply(&mut reader) => PumpEvent::Reply(item),
            };

            match event {
                PumpEvent::Stop => {
                    self.stop.store(true, Ordering::SeqCst);
                    // Release the old origin read half before acknowledging,
                    // so the switch path owns the socket exclusively.
                    drop(reader);
                    let _ = stop_done_tx.send(()).await;
                    return PumpExit::Stopped;
                }
                PumpEvent::Reply(Ok(Some(block))) => {
                    if let Err(exit) = self.process_reply(block, &mut withheld).await {
                        return exit;
                    }
                }
                PumpEvent::Reply(Ok(None)) => return PumpExit::Closed,
                PumpEvent::Reply(Err(err)) => return PumpExit::Failed(err),
            }
        }
    }

    // Applies the proxy-timeout rule: the origin read deadline is armed
    // while no data transfer is running and cleared during transfers.
    async fn next_reply(&self, reader: &mut ReplyReader) -> Result<Option<ReplyBlock>, ProxyError> {
        let deadline = self.config.proxy_timeout > 0 && !self.in_data_transfer.load(Ordering::SeqCst);
        let item = if deadline {
            match tokio::time::timeout(Duration::from_secs(self.config.proxy_timeout), reader.next()).await {
                Ok(item) => item,
                Err(_) => return Err(ProxyError::ProxyTimeout),
            }
        } else {
            reader.next().await
        };
        match item {
            Some(Ok(block)) => Ok(Some(block)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn process_reply(&self, block: ReplyBlock, withheld: &mut Vec<Bytes>) -> Result<(), PumpExit> {
        let code = block.code;
        slog::debug!(self.logger, "response from origin: {}", String::from_utf8_lossy(&block.buf).trim_end());

        // The first greeting carries the proxy's own banner instead.
        let mut buf = block.buf.clone();
        if code == Some(220) && !self.is_switched() {
            buf = Bytes::from(self.welcome.clone());
        }

        // Origins that don't speak the proxy protocol reject the preamble
        // with "500 PROXY"; with mixed origin fleets that reply is noise.
        if self.config.proxy_protocol && block.starts_with(b"500 PROXY") {
            return Ok(());
        }

        if self.config.data_chan_proxy && self.is_switched() {
            match self.handle_data_reply(code, &buf).await {
                Ok(Some(rewritten)) => buf = rewritten,
                Ok(None) => {}
                Err(err) => return Err(PumpExit::Failed(err)),
            }
        }

        if self.pass_through.load(Ordering::SeqCst) {
            if let Err(err) = self.write_client(&buf).await {
                if is_closed_write_error(&err) {
                    slog::debug!(self.logger, "client connection already closed: {}", err);
                } else {
                    slog::error!(self.logger, "error on write response to client: {}", err);
                    return Err(PumpExit::Failed(err.into()));
                }
            }
            slog::debug!(self.logger, "response to client: {}", String::from_utf8_lossy(&buf).trim_end());
        } else {
            // A reply read while suspended belongs to the switch dialogue
            // and must not race out to the client.
            slog::debug!(self.logger, "withholding response while suspended");
            withheld.push(buf);
        }

        // A successful login is the cue for the pending origin switch.
        if matches!(code, Some(230) | Some(232)) && !self.is_switched() {
            let _ = self.control_tx.try_send(ControlChanMsg::LoginOk {
                code: code.unwrap_or_default(),
            });
        }

        Ok(())
    }

    // Data channel interception on 227/229 and on the ack of a preceding
    // PORT/EPRT. Returns the rewritten line to forward, if any.
    async fn handle_data_reply(&self, code: Option<u16>, buf: &Bytes) -> Result<Option<Bytes>, ProxyError> {
        let pending = { self.session.lock().await.pending_data_cmd };
        let Some(mode) = pending else {
            return Ok(None);
        };
        let Some(handler) = self.data_handler.lock().await.clone() else {
            return Ok(None);
        };

        let line = String::from_utf8_lossy(buf).into_owned();
        let rewritten = match (code, mode) {
            (Some(227), DataMode::Pasv) => {
                let origin = datachan::parse_pasv_reply(&line)?;
                handler.set_origin_endpoint(SocketAddr::V4(origin)).await;
                let masquerade_ip = self
                    .config
                    .masquerade_ip
                    .ok_or_else(|| ProxyError::DataParse("masquerade_ip is not configured".to_string()))?;
                datachan::format_pasv_reply(masquerade_ip, handler.listen_port())
            }
            (Some(229), DataMode::Epsv) => {
                let port = datachan::parse_epsv_reply(&line)?;
                handler.set_origin_endpoint(SocketAddr::new(self.origin_peer_ip(), port)).await;
                datachan::format_epsv_reply(handler.listen_port())
            }
            (Some(200), DataMode::Port | DataMode::Eprt) => datachan::format_data_ack(mode),
            _ => {
                // The origin refused the data command. Release the handler
                // so the next data command does not wait forever.
                self.session.lock().await.pending_data_cmd = None;
                handler.release();
                return Ok(None);
            }
        };

        self.session.lock().await.pending_data_cmd = None;
        handler.spawn_transfer().await;
        Ok(Some(Bytes::from(rewritten)))
    }

    async fn write_client(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.client_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "client connection closed"))?;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    /// Tears down the origin side: parks or unblocks the pump runner and
    /// closes the origin socket and any data handler.
    pub(crate) async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
        let _ = self.switch_tx.try_send(false);
        self.origin_writer.lock().await.take();
        self.origin_reader.lock().await.take();
        self.close_data_handler().await;
    }
}

/// Runs the reply pump until the connection ends, restarting it across a
/// successful origin switch.
pub(crate) fn spawn_pump(proxy: Arc<ProxyServer>, channels: PumpChannels) -> JoinHandle<()> {
    tokio::spawn(async move {
        let PumpChannels {
            mut stop_rx,
            stop_done_tx,
            mut switch_rx,
        } = channels;

        loop {
            match proxy.response_proxy(&mut stop_rx, &stop_done_tx).await {
                PumpExit::Stopped => match switch_rx.recv().await {
                    Some(true) => continue,
                    _ => break,
                },
                PumpExit::Closed => {
                    let _ = proxy.control_tx.send(ControlChanMsg::OriginClosed).await;
                    break;
                }
                PumpExit::Failed(err) => {
                    // During teardown read errors are expected noise.
                    if !proxy.stop.load(Ordering::SeqCst) {
                        let _ = proxy.control_tx.send(ControlChanMsg::PumpFailed(err)).await;
                    }
                    break;
                }
            }
        }

        proxy.close_data_handler().await;
    })
}

/// Dials an origin with the fixed connect timeout and applies the TCP
/// tuning every proxied socket gets.
pub(crate) async fn dial_origin(addr: &str, keepalive_secs: u64) -> Result<TcpStream, ProxyError> {
    let connect = TcpStream::connect(addr);
    let stream = tokio::time::timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS), connect)
        .await
        .map_err(|_| ProxyError::OriginUnreachable(addr.to_string()))?
        .map_err(|_| ProxyError::OriginUnreachable(addr.to_string()))?;
    tune_socket(&stream, keepalive_secs)?;
    Ok(stream)
}

// Keepalive keeps half-dead origins from holding connections open; linger 0
// makes close drop pending output instead of blocking.
pub(crate) fn tune_socket(stream: &TcpStream, keepalive_secs: u64) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let mut keepalive = socket2::TcpKeepalive::new();
    if keepalive_secs > 0 {
        keepalive = keepalive.with_time(Duration::from_secs(keepalive_secs));
    }
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_linger(Some(Duration::from_secs(0)))?;
    Ok(())
}

// Writes the PROXY protocol v1 preamble. The destination must be an IPv4
// address, so the origin host is resolved and the first A record is used.
async fn send_proxy_header<W>(writer: &mut W, client_addr: SocketAddr, origin_addr: &str) -> Result<(), ProxyError>
where
    W: AsyncWriteExt + Unpin,
{
    let source = match client_addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => return Err(ProxyError::Ipv4Required),
    };
    let destination = tokio::net::lookup_host(origin_addr)
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or(ProxyError::Ipv4Required)?;

    let header = ProxyHeader::Version1 {
        addresses: ProxyAddresses::Ipv4 { source, destination },
    };
    let buf = proxy_protocol::encode(header).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// Reads a single line without buffering past it, so the bytes that follow
// stay on the stream for whoever reads next (the framed pump, or a TLS
// handshake).
async fn read_line<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Err(ProxyError::OriginClosed);
            }
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(ProxyError::LineTooLong);
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn host_part(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => host.trim_matches(['[', ']']).to_string(),
        None => addr.to_string(),
    }
}
