//! The server side of the proxy: the accept loop plus everything each
//! accepted connection is built from.

pub(crate) mod chancomms;
pub(crate) mod controlchan;
pub(crate) mod datachan;
pub(crate) mod error;
pub(crate) mod proxy;
pub(crate) mod session;
pub(crate) mod shutdown;
pub(crate) mod stream;
pub(crate) mod tls;

use crate::config::Config;
use crate::events::EventSink;
use crate::middleware::Middleware;
use error::ServerError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// An instance of the FTP reverse proxy.
///
/// Configure it in a builder-like fashion, then start it with
/// [`listen`](Server::listen):
///
/// ```rust,no_run
/// use ftpgate::{Config, Server};
///
/// # async fn run() -> Result<(), ftpgate::ServerError> {
/// let config = Config {
///     listen_addr: "0.0.0.0:2121".to_string(),
///     remote_addr: "10.0.0.5:21".to_string(),
///     ..Config::default()
/// };
/// Server::new(config).listen().await
/// # }
/// ```
pub struct Server {
    config: Config,
    logger: slog::Logger,
    middleware: HashMap<String, Arc<dyn Middleware>>,
    event_sink: Option<EventSink>,
}

impl Server {
    /// Creates a server from the given configuration. Logging is discarded
    /// until a logger is supplied with [`logger`](Server::logger).
    pub fn new(config: Config) -> Self {
        Server {
            config,
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            middleware: HashMap::new(),
            event_sink: None,
        }
    }

    /// Sets the structured logger the server and its connections log to.
    pub fn logger(mut self, logger: slog::Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the sink that lifecycle events are published to. See
    /// [`event_channel`](crate::event_channel).
    pub fn event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Registers a middleware for an FTP verb. Verbs are matched case
    /// insensitively and carry at most one middleware; registering a verb
    /// twice replaces the earlier hook.
    pub fn middleware<M>(mut self, verb: &str, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware.insert(verb.to_ascii_uppercase(), Arc::new(middleware));
        self
    }

    /// Binds the listener and serves until a shutdown signal arrives.
    /// Binding or TLS keypair failures are fatal and returned immediately.
    pub async fn listen(self) -> Result<(), ServerError> {
        let Server {
            config,
            logger,
            middleware,
            event_sink,
        } = self;
        let config = Arc::new(config);

        let tls_acceptor = match &config.tls {
            Some(pair) => {
                let tls_config = tls::server_config(&pair.cert, &pair.key).map_err(ServerError::Tls)?;
                Some(TlsAcceptor::from(tls_config))
            }
            None => None,
        };

        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|source| ServerError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;
        slog::info!(logger, "listening on {}", config.listen_addr);

        let shutdown_topic = Arc::new(shutdown::Notifier::new());
        {
            let topic = shutdown_topic.clone();
            let logger = logger.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                slog::info!(logger, "shutting down");
                topic.notify().await;
            });
        }

        let connections = Arc::new(AtomicI32::new(0));
        let params = controlchan::SpawnParams {
            config: config.clone(),
            logger: logger.clone(),
            middleware: Arc::new(middleware),
            event_sink,
            tls_acceptor,
            connections: connections.clone(),
        };

        let mut accept_shutdown = shutdown_topic.subscribe().await;
        loop {
            tokio::select! {
                _ = accept_shutdown.listen() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        slog::info!(logger, "incoming control connection from {}", peer);
                        if config.max_connections > 0 && connections.load(Ordering::SeqCst) >= config.max_connections {
                            slog::warn!(logger, "connection limit reached, rejecting {}", peer);
                            tokio::spawn(async move {
                                let mut stream = stream;
                                let _ = stream.write_all(b"421 Too many connections, closing control connection.\r\n").await;
                                let _ = stream.shutdown().await;
                            });
                            continue;
                        }
                        connections.fetch_add(1, Ordering::SeqCst);
                        let handler_params = params.clone();
                        let shutdown_listener = shutdown_topic.subscribe().await;
                        tokio::spawn(controlchan::handle_client(handler_params, stream, shutdown_listener));
                    }
                    Err(err) => {
                        slog::error!(logger, "error accepting incoming control connection: {}", err);
                    }
                }
            }
        }

        drop(listener);
        drop(accept_shutdown);
        shutdown_topic.linger().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut interrupt), Ok(mut terminate)) => {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
