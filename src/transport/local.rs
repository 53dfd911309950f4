//! # Local Transport
//!
//! In-process transport connecting any number of client endpoints to one
//! server without sockets. Every endpoint created with
//! [`LocalTransport::endpoint`] shares the same hub, so a test or a
//! host-mode application can run a server and several clients in one process.
//!
//! Data is delivered on the next poll, the same way a socket transport would
//! deliver it, and all lifecycle events use the same queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};
use crate::transport::{
    ConnectionId, DisconnectKind, EventProducer, EventQueue, Peer, Role, Transport, TransportEvent,
};

struct Hub {
    server_events: EventQueue,
    /// Event producers of connected client endpoints
    clients: Mutex<HashMap<ConnectionId, EventProducer>>,
    next_id: AtomicU32,
    frame_size_limit: u32,
}

/// One endpoint of an in-process hub
pub struct LocalTransport {
    hub: Arc<Hub>,
    id: ConnectionId,
    client_events: EventQueue,
}

impl LocalTransport {
    /// Create a hub with no frame limit and its first endpoint
    pub fn new() -> Self {
        Self::with_frame_size_limit(u32::MAX)
    }

    /// Create a hub whose batches are capped at `frame_size_limit` bytes
    pub fn with_frame_size_limit(frame_size_limit: u32) -> Self {
        let hub = Arc::new(Hub {
            server_events: EventQueue::new(),
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            frame_size_limit,
        });
        Self::attach(hub)
    }

    /// Create another client endpoint on the same hub
    pub fn endpoint(&self) -> Self {
        Self::attach(self.hub.clone())
    }

    fn attach(hub: Arc<Hub>) -> Self {
        let id = ConnectionId(hub.next_id.fetch_add(1, Ordering::Relaxed));
        Self {
            hub,
            id,
            client_events: EventQueue::new(),
        }
    }

    /// Id the server sees for this endpoint's client
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn clients(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ConnectionId, EventProducer>>> {
        self.hub
            .clients
            .lock()
            .map_err(|_| ProtocolError::TransportError("local hub lock poisoned".to_string()))
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn frame_size_limit(&self) -> u32 {
        self.hub.frame_size_limit
    }

    #[instrument(skip(self), fields(endpoint = %self.id))]
    fn connect(&self, address: &str) -> Result<()> {
        let mut clients = self.clients()?;
        if clients.contains_key(&self.id) {
            return Err(ProtocolError::TransportError(format!(
                "endpoint {} is already connected",
                self.id
            )));
        }
        clients.insert(self.id, self.client_events.producer());

        self.client_events
            .push(TransportEvent::Connected(Peer::Server));
        self.hub
            .server_events
            .push(TransportEvent::Connected(Peer::Client(self.id)));

        debug!("Local endpoint connected");
        Ok(())
    }

    fn send(&self, peer: Peer, data: Bytes) -> Result<()> {
        let clients = self.clients()?;
        match peer {
            Peer::Server => {
                if !clients.contains_key(&self.id) {
                    return Err(ProtocolError::NotConnected);
                }
                self.hub
                    .server_events
                    .push(TransportEvent::DataReceived(Peer::Client(self.id), data));
            }
            Peer::Client(id) => {
                let client = clients.get(&id).ok_or_else(|| {
                    ProtocolError::TransportError(format!("no local client {id}"))
                })?;
                client.push(TransportEvent::DataReceived(Peer::Server, data));
            }
        }
        Ok(())
    }

    fn disconnect(&self, peer: Peer) {
        let Ok(mut clients) = self.clients() else {
            return;
        };

        match peer {
            Peer::Server => {
                if clients.remove(&self.id).is_some() {
                    self.client_events.push(TransportEvent::Disconnected(
                        Peer::Server,
                        DisconnectKind::SelfInitiated,
                    ));
                    self.hub.server_events.push(TransportEvent::Disconnected(
                        Peer::Client(self.id),
                        DisconnectKind::Forced,
                    ));
                }
            }
            Peer::Client(id) => {
                if let Some(client) = clients.remove(&id) {
                    self.hub.server_events.push(TransportEvent::Disconnected(
                        Peer::Client(id),
                        DisconnectKind::SelfInitiated,
                    ));
                    client.push(TransportEvent::Disconnected(
                        Peer::Server,
                        DisconnectKind::Forced,
                    ));
                }
            }
        }
    }

    fn poll(&self, role: Role, events: &mut Vec<TransportEvent>) {
        match role {
            Role::Server => self.hub.server_events.drain_into(events),
            Role::Client => self.client_events.drain_into(events),
        };
    }
}
