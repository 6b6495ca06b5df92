//! Lifecycle events published by the proxy.
//!
//! The server publishes an [`Event`] whenever a client connects or
//! disconnects, for every command relayed to an origin, at the end of every
//! data transfer and when a connection fails. Events are delivered through a
//! bounded channel with non-blocking send semantics: a slow or absent
//! consumer never stalls a proxy session, it only loses events.

use thiserror::Error;
use tokio::sync::mpsc;

/// An event emitted by the proxy. The variant payloads mirror what a typical
/// consumer (metrics forwarder, audit log) needs without further lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A client established a control connection.
    ClientConnect {
        /// Remote address of the client.
        remote_addr: String,
        /// Number of live connections, this one included.
        client_count: i32,
    },
    /// A client control connection ended.
    ClientDisconnect {
        /// Remote address of the client.
        remote_addr: String,
        /// Number of live connections remaining.
        client_count: i32,
    },
    /// A command line was relayed to the origin. `PASS` arguments are
    /// redacted before the event is built.
    ClientCommand {
        /// Remote address of the client.
        remote_addr: String,
        /// The command line, without its line terminator.
        command: String,
    },
    /// A data transfer finished, successfully or not.
    DataTransfer {
        /// Address of the client side data socket.
        src_addr: String,
        /// Address of the origin side data socket.
        dst_addr: String,
        /// Bytes copied over the data channel, both directions combined.
        bytes: u64,
    },
    /// A connection failed in a way that was surfaced to the client.
    Error {
        /// Remote address of the client.
        remote_addr: String,
        /// Human readable description of the failure.
        message: String,
    },
}

impl Event {
    /// The tag identifying the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ClientConnect { .. } => "client-connect",
            Event::ClientDisconnect { .. } => "client-disconnect",
            Event::ClientCommand { .. } => "client-command",
            Event::DataTransfer { .. } => "data-transfer",
            Event::Error { .. } => "error",
        }
    }
}

/// Error returned when an event could not be delivered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// The channel buffer is full or the receiver is gone.
    #[error("no receivers")]
    NoReceivers,
}

/// Receiving half of an event channel.
pub type EventReceiver = mpsc::Receiver<Event>;

/// Sending half of an event channel. Cheap to clone; one sink is shared by
/// all connection handlers of a server.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Send an event without blocking. Fails with
    /// [`EventError::NoReceivers`] when the buffer is full or the receiver
    /// was dropped.
    pub fn send(&self, event: Event) -> Result<(), EventError> {
        self.tx.try_send(event).map_err(|_| EventError::NoReceivers)
    }

    // Best effort publish used by the handlers: backpressure is logged, never
    // propagated.
    pub(crate) fn publish(&self, logger: &slog::Logger, event: Event) {
        if let Err(err) = self.send(event) {
            slog::warn!(logger, "could not publish event: {}", err);
        }
    }
}

/// Creates an event channel with the given buffer size. A zero size is
/// rounded up to one slot, the smallest buffer the runtime supports.
pub fn event_channel(buffer: usize) -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (EventSink { tx }, rx)
}
