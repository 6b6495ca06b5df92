//! Contains code pertaining to the FTP *control* channel: the per-client
//! command pump and everything it coordinates.

pub(crate) mod codecs;
pub(crate) mod line_parser;
pub(crate) mod reply;

use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::middleware::{Context, Middleware};
use crate::server::chancomms::{ControlChanMsg, ControlChanReceiver};
use crate::server::datachan::{self, DataHandler, DataMode};
use crate::server::error::ProxyError;
use crate::server::proxy::{self, ProxyServer, SharedClientWriter};
use crate::server::session::{Session, SharedSession};
use crate::server::shutdown;
use crate::server::stream::{BoxedStream, StreamReadHalf};
use crate::server::tls::TlsVersion;

use codecs::CommandCodec;
use futures_util::StreamExt;
use reply::Reply;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::FramedRead;

type CommandReader = FramedRead<StreamReadHalf, CommandCodec>;

// Everything a connection handler needs from the server.
#[derive(Clone)]
pub(crate) struct SpawnParams {
    pub config: Arc<Config>,
    pub logger: slog::Logger,
    pub middleware: Arc<HashMap<String, Arc<dyn Middleware>>>,
    pub event_sink: Option<EventSink>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub connections: Arc<AtomicI32>,
}

enum Flow {
    Continue,
    Close,
}

enum Incoming {
    Client(Option<Result<String, ProxyError>>),
    Internal(Option<ControlChanMsg>),
    IdleTimeout,
    Shutdown,
}

/// Drives one client connection from accept to teardown.
pub(crate) async fn handle_client(params: SpawnParams, tcp: TcpStream, mut shutdown_listener: shutdown::Listener) {
    let SpawnParams {
        config,
        logger,
        middleware,
        event_sink,
        tls_acceptor,
        connections,
    } = params;

    let peer = match tcp.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            slog::error!(logger, "could not read client address: {}", err);
            connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };
    if let Err(err) = proxy::tune_socket(&tcp, config.keepalive_time) {
        slog::debug!(logger, "could not tune client socket: {}", err);
    }

    let session: SharedSession = Arc::new(Mutex::new(Session::new(peer)));
    let trace_id = { session.lock().await.trace_id };
    let logger = logger.new(slog::o!("source" => peer.to_string(), "trace-id" => trace_id.to_string()));

    if let Some(sink) = &event_sink {
        sink.publish(
            &logger,
            Event::ClientConnect {
                remote_addr: peer.to_string(),
                client_count: connections.load(Ordering::SeqCst),
            },
        );
    }

    let (read_half, write_half) = tokio::io::split(Box::new(tcp) as BoxedStream);
    let client_writer: SharedClientWriter = Arc::new(Mutex::new(Some(write_half)));
    let mut reader: Option<CommandReader> = Some(FramedRead::new(read_half, CommandCodec::new()));

    let (control_tx, control_rx) = mpsc::channel(8);
    let in_data_transfer = Arc::new(AtomicBool::new(false));

    let connected = ProxyServer::connect(
        config.clone(),
        logger.clone(),
        session.clone(),
        client_writer.clone(),
        in_data_transfer.clone(),
        control_tx,
    )
    .await;
    let (proxy, pump_channels) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            slog::error!(logger, "could not connect to origin: {}", err);
            if let Some(sink) = &event_sink {
                sink.publish(
                    &logger,
                    Event::Error {
                        remote_addr: peer.to_string(),
                        message: err.to_string(),
                    },
                );
            }
            if let Some(mut writer) = client_writer.lock().await.take() {
                let _ = writer.write_all(b"421 Service not available, closing control connection.\r\n").await;
                let _ = writer.shutdown().await;
            }
            disconnect(&logger, &event_sink, &connections, peer);
            return;
        }
    };

    let pump_task = proxy::spawn_pump(proxy.clone(), pump_channels);

    let handler = Handler {
        config,
        logger: logger.clone(),
        session,
        proxy: proxy.clone(),
        client_writer: client_writer.clone(),
        event_sink: event_sink.clone(),
        middleware,
        tls_acceptor,
        peer,
        in_data_transfer,
    };

    handler.run(&mut reader, control_rx, &mut shutdown_listener).await;

    proxy.shutdown().await;
    client_writer.lock().await.take();
    drop(reader);
    let _ = tokio::time::timeout(Duration::from_secs(5), pump_task).await;
    disconnect(&logger, &event_sink, &connections, peer);
}

fn disconnect(logger: &slog::Logger, event_sink: &Option<EventSink>, connections: &Arc<AtomicI32>, peer: SocketAddr) {
    let remaining = connections.fetch_sub(1, Ordering::SeqCst) - 1;
    if let Some(sink) = event_sink {
        sink.publish(
            logger,
            Event::ClientDisconnect {
                remote_addr: peer.to_string(),
                client_count: remaining,
            },
        );
    }
    slog::info!(logger, "client disconnected");
}

struct Handler {
    config: Arc<Config>,
    logger: slog::Logger,
    session: SharedSession,
    proxy: Arc<ProxyServer>,
    client_writer: SharedClientWriter,
    event_sink: Option<EventSink>,
    middleware: Arc<HashMap<String, Arc<dyn Middleware>>>,
    tls_acceptor: Option<TlsAcceptor>,
    peer: SocketAddr,
    in_data_transfer: Arc<AtomicBool>,
}

impl Handler {
    async fn run(&self, reader: &mut Option<CommandReader>, mut control_rx: ControlChanReceiver, shutdown_listener: &mut shutdown::Listener) {
        loop {
            let incoming = {
                let Some(source) = reader.as_mut() else { break };
                let mut idle = Box::pin(tokio::time::sleep(Duration::from_secs(self.config.idle_timeout)));
                tokio::select! {
                    line = source.next() => Incoming::Client(line),
                    msg = control_rx.recv() => Incoming::Internal(msg),
                    _ = &mut idle => Incoming::IdleTimeout,
                    _ = shutdown_listener.listen() => Incoming::Shutdown,
                }
            };

            match incoming {
                Incoming::Client(Some(Ok(line))) => {
                    if matches!(self.handle_command(line, reader).await, Flow::Close) {
                        break;
                    }
                }
                Incoming::Client(Some(Err(err))) => {
                    slog::warn!(self.logger, "could not read client command: {}", err);
                    let _ = self.write_reply(&Reply::new(500, "Syntax error, command unrecognized")).await;
                    break;
                }
                Incoming::Client(None) => {
                    slog::debug!(self.logger, "client closed the connection");
                    break;
                }
                Incoming::Internal(Some(ControlChanMsg::LoginOk { code })) => {
                    slog::debug!(self.logger, "login acknowledged by origin with {}", code);
                    if matches!(self.maybe_switch().await, Flow::Close) {
                        break;
                    }
                }
                Incoming::Internal(Some(ControlChanMsg::OriginClosed)) => {
                    slog::debug!(self.logger, "origin closed the connection");
                    break;
                }
                Incoming::Internal(Some(ControlChanMsg::PumpFailed(err))) => {
                    slog::error!(self.logger, "origin connection failed: {}", err);
                    self.publish_error(&err.to_string());
                    let _ = self.write_reply(&Reply::new(421, "Service not available, closing control connection")).await;
                    break;
                }
                Incoming::Internal(None) => break,
                Incoming::IdleTimeout => {
                    // Data transfers disarm the idle deadline.
                    if self.in_data_transfer.load(Ordering::SeqCst) {
                        continue;
                    }
                    slog::info!(self.logger, "closing idle connection");
                    let _ = self.write_reply(&Reply::new(421, "Idle timeout, closing control connection")).await;
                    break;
                }
                Incoming::Shutdown => {
                    let _ = self.write_reply(&Reply::new(421, "Service is shutting down")).await;
                    break;
                }
            }
        }
    }

    async fn handle_command(&self, line: String, reader: &mut Option<CommandReader>) -> Flow {
        let redacted = line_parser::redact(&line);
        slog::debug!(self.logger, "read from client: {}", redacted);
        let (verb, arg) = line_parser::parse_command(&line);

        self.publish(Event::ClientCommand {
            remote_addr: self.peer.to_string(),
            command: redacted,
        });

        if let Some(middleware) = self.middleware.get(&verb) {
            let mut ctx = {
                let session = self.session.lock().await;
                Context::new(self.peer, session.next_origin_addr.clone(), session.tls_protocol)
            };
            match middleware.handle(&mut ctx, &arg).await {
                Ok(short_circuit) => {
                    self.session.lock().await.next_origin_addr = ctx.next_origin_addr().map(str::to_string);
                    if let Some(reply) = short_circuit {
                        if let Err(err) = self.write_reply(&reply).await {
                            slog::debug!(self.logger, "could not write middleware reply: {}", err);
                            return Flow::Close;
                        }
                        return Flow::Continue;
                    }
                }
                Err(err) => {
                    slog::error!(self.logger, "middleware for {} failed: {}", verb, err);
                    self.publish_error(&err.to_string());
                    let _ = self.write_reply(&Reply::new(421, "Service not available, closing control connection")).await;
                    return Flow::Close;
                }
            }
        }

        match verb.as_str() {
            "USER" => {
                self.session.lock().await.auth_user = Some(arg.clone());
            }
            "AUTH" => return self.handle_auth(&arg, &line, reader).await,
            "PBSZ" | "PROT" => {
                // Recorded for replay against a freshly bound origin, then
                // forwarded like any other command.
                if let Ok(normalized) = line_parser::normalize_command_line(&line) {
                    self.session.lock().await.previous_tls_commands.push(normalized);
                }
            }
            "PASV" | "EPSV" | "PORT" | "EPRT" if self.config.data_chan_proxy && self.proxy.is_switched() => {
                let mode = match verb.as_str() {
                    "PASV" => DataMode::Pasv,
                    "EPSV" => DataMode::Epsv,
                    "PORT" => DataMode::Port,
                    _ => DataMode::Eprt,
                };
                return self.handle_data_command(mode, &arg, &line).await;
            }
            _ => {}
        }

        self.forward(&line).await
    }

    // AUTH TLS/SSL is answered by the proxy itself: 234, then a TLS
    // handshake with the client. The command is recorded so the same
    // upgrade can be replayed against a switched origin.
    async fn handle_auth(&self, arg: &str, line: &str, reader: &mut Option<CommandReader>) -> Flow {
        let param = arg.trim().to_ascii_uppercase();
        if param != "TLS" && param != "SSL" {
            let _ = self.write_reply(&Reply::new(504, "AUTH type not supported")).await;
            return Flow::Continue;
        }
        let Some(acceptor) = self.tls_acceptor.clone() else {
            let _ = self.write_reply(&Reply::new(550, "Cannot get a TLS config")).await;
            return Flow::Continue;
        };

        if let Ok(normalized) = line_parser::normalize_command_line(line) {
            self.session.lock().await.previous_tls_commands.push(normalized);
        }
        if let Err(err) = self.write_reply(&Reply::new(234, "AUTH command ok. Expecting TLS Negotiation.")).await {
            slog::debug!(self.logger, "could not acknowledge AUTH: {}", err);
            return Flow::Close;
        }

        let Some(framed) = reader.take() else { return Flow::Close };
        let read_half = framed.into_inner();
        let Some(write_half) = self.client_writer.lock().await.take() else {
            return Flow::Close;
        };
        let stream = read_half.unsplit(write_half);

        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let negotiated = {
                    let (_, connection) = tls_stream.get_ref();
                    connection.protocol_version().and_then(TlsVersion::from_protocol)
                };
                self.session.lock().await.tls_protocol = negotiated;

                let boxed: BoxedStream = Box::new(tls_stream);
                let (read_half, write_half) = tokio::io::split(boxed);
                *self.client_writer.lock().await = Some(write_half);
                *reader = Some(FramedRead::new(read_half, CommandCodec::new()));

                match negotiated {
                    Some(version) => slog::info!(self.logger, "control channel upgraded to {}", version),
                    None => slog::info!(self.logger, "control channel upgraded to TLS"),
                }
                Flow::Continue
            }
            Err(err) => {
                slog::warn!(self.logger, "could not upgrade control channel to TLS: {}", err);
                Flow::Close
            }
        }
    }

    // A data command gets its own handler, bound before anything reaches
    // the origin so the advertised endpoint is accepting by the time the
    // origin (or the client) hears about it.
    async fn handle_data_command(&self, mode: DataMode, arg: &str, line: &str) -> Flow {
        let client_endpoint = match mode {
            DataMode::Pasv | DataMode::Epsv => None,
            DataMode::Port => match datachan::parse_port_arg(arg) {
                Ok(endpoint) => Some(SocketAddr::V4(endpoint)),
                Err(err) => {
                    slog::warn!(self.logger, "{}", err);
                    let _ = self.write_reply(&Reply::new(501, "Syntax error in parameters or arguments")).await;
                    return Flow::Continue;
                }
            },
            DataMode::Eprt => match datachan::parse_eprt_arg(arg) {
                Ok(endpoint) => Some(endpoint),
                Err(err) => {
                    slog::warn!(self.logger, "{}", err);
                    let _ = self.write_reply(&Reply::new(501, "Syntax error in parameters or arguments")).await;
                    return Flow::Continue;
                }
            },
        };

        let built = match client_endpoint {
            None => {
                DataHandler::passive(
                    mode,
                    &self.config,
                    self.logger.clone(),
                    self.event_sink.clone(),
                    self.in_data_transfer.clone(),
                )
                .await
            }
            Some(endpoint) => {
                DataHandler::active(
                    mode,
                    endpoint,
                    &self.config,
                    self.logger.clone(),
                    self.event_sink.clone(),
                    self.in_data_transfer.clone(),
                )
                .await
            }
        };
        let handler = match built {
            Ok(handler) => handler,
            Err(err) => {
                slog::warn!(self.logger, "could not set up data handler: {}", err);
                self.publish_error(&err.to_string());
                let _ = self.write_reply(&Reply::new(425, "Can't open data connection")).await;
                return Flow::Continue;
            }
        };

        // Active modes advertise the proxy to the origin instead of the
        // client's own endpoint.
        let line_to_origin = match mode {
            DataMode::Pasv | DataMode::Epsv => line.to_string(),
            DataMode::Port => {
                let IpAddr::V4(proxy_ip) = self.proxy.origin_local_ip() else {
                    let _ = self.write_reply(&Reply::new(501, "Cannot advertise an IPv4 endpoint")).await;
                    return Flow::Continue;
                };
                format!("PORT {}\r\n", datachan::format_port_arg(proxy_ip, handler.listen_port()))
            }
            DataMode::Eprt => {
                let endpoint = SocketAddr::new(self.proxy.origin_local_ip(), handler.listen_port());
                format!("EPRT {}\r\n", datachan::format_eprt_arg(endpoint))
            }
        };

        self.proxy.set_data_handler(handler).await;
        self.session.lock().await.pending_data_cmd = Some(mode);
        self.forward(&line_to_origin).await
    }

    async fn forward(&self, line: &str) -> Flow {
        match self.proxy.send_to_origin(line).await {
            Ok(()) => Flow::Continue,
            Err(ProxyError::BadCommandLine) => {
                let _ = self.write_reply(&Reply::new(500, "Syntax error, command unrecognized")).await;
                Flow::Close
            }
            Err(err) => {
                slog::error!(self.logger, "send to origin error: {}", err);
                self.publish_error(&err.to_string());
                Flow::Close
            }
        }
    }

    async fn maybe_switch(&self) -> Flow {
        let (next, user) = {
            let session = self.session.lock().await;
            (session.next_origin_addr.clone(), session.auth_user.clone())
        };
        let Some(next) = next else { return Flow::Continue };
        if self.proxy.is_switched() || next == self.proxy.current_origin_addr() {
            return Flow::Continue;
        }
        slog::debug!(self.logger, "routing {} to {}", user.as_deref().unwrap_or("unknown"), next);
        match self.proxy.switch_origin(&next).await {
            Ok(()) => Flow::Continue,
            Err(err) => {
                slog::error!(self.logger, "origin switch failed: {}", err);
                self.publish_error(&err.to_string());
                let _ = self.write_reply(&Reply::new(421, "Service not available, closing control connection")).await;
                Flow::Close
            }
        }
    }

    async fn write_reply(&self, reply: &Reply) -> io::Result<()> {
        slog::debug!(self.logger, "response to client: {}", reply);
        let mut guard = self.client_writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "client connection closed"))?;
        writer.write_all(reply.to_line().as_bytes()).await?;
        writer.flush().await
    }

    fn publish(&self, event: Event) {
        if let Some(sink) = &self.event_sink {
            sink.publish(&self.logger, event);
        }
    }

    fn publish_error(&self, message: &str) {
        self.publish(Event::Error {
            remote_addr: self.peer.to_string(),
            message: message.to_string(),
        });
    }
}
