//! # Transport Layer
//!
//! Contract between the messaging core and the byte-moving transports.
//!
//! A transport owns all socket I/O. It never touches connection, dispatcher
//! or replication state. Everything it observes (a peer connected, bytes
//! arrived, a link closed, an error) is pushed as a [`TransportEvent`] into a
//! thread-safe [`EventQueue`], and the application drains that queue once per
//! tick through [`Transport::poll`]. Many producers (one per socket task) may
//! push concurrently; the tick thread is the only consumer.
//!
//! ## Implementations
//! - [`local::LocalTransport`]: in-process hub, no sockets
//! - [`tcp::TcpTransport`]: tokio-backed TCP with one reader and one writer task per peer
//!
//! ## Addressing
//! A [`Peer`] names the remote side from the local role's point of view:
//! a server sees `Peer::Client(id)`, a client sees `Peer::Server`.

use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod local;
pub mod tcp;

/// Transport-assigned id of a client link, unique per transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// The server, seen from a client
    Server,
    /// A client, seen from the server
    Client(ConnectionId),
}

impl Peer {
    /// Local role that talks to this peer
    pub fn local_role(&self) -> Role {
        match self {
            Peer::Server => Role::Client,
            Peer::Client(_) => Role::Server,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Server => write!(f, "server"),
            Peer::Client(id) => write!(f, "client#{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

/// Which side ended a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    /// Ended by this side
    SelfInitiated,
    /// Ended by the remote side or by the transport
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Client transport error: {0}")]
    Client(String),

    #[error("Server transport error: {0}")]
    Server(String),

    #[error("Transport error on connection {id}: {message}")]
    Connection { id: ConnectionId, message: String },
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected(Peer),
    DataReceived(Peer, Bytes),
    Disconnected(Peer, DisconnectKind),
    Error(TransportError),
}

/// Byte-stream transport driven by the application tick
pub trait Transport: Send + Sync {
    /// Largest batch, header included, a single `send` may carry
    fn frame_size_limit(&self) -> u32;

    /// Start connecting the client role to `address`. Completion arrives as
    /// `Connected(Peer::Server)` or an `Error` event.
    fn connect(&self, address: &str) -> Result<()>;

    /// Queue `data` for delivery to `peer`
    fn send(&self, peer: Peer, data: Bytes) -> Result<()>;

    /// Close the link to `peer`. The local side observes
    /// `Disconnected(peer, SelfInitiated)`, the remote side a forced disconnect.
    fn disconnect(&self, peer: Peer);

    /// Move every pending event for `role` into `events`
    fn poll(&self, role: Role, events: &mut Vec<TransportEvent>);
}

/// Multi-producer, single-consumer event queue
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Handle for pushing events from another thread or task
    pub fn producer(&self) -> EventProducer {
        EventProducer {
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, event: TransportEvent) {
        // The receiver lives as long as self, so this cannot fail
        let _ = self.tx.send(event);
    }

    /// Drain all queued events without blocking. Returns how many were moved.
    pub fn drain_into(&self, events: &mut Vec<TransportEvent>) -> usize {
        let Ok(mut rx) = self.rx.lock() else {
            return 0;
        };

        let before = events.len();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events.len() - before
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventProducer {
    /// Push an event. Returns false if the queue is gone.
    pub fn push(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
