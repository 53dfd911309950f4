//! # TCP Transport
//!
//! Tokio-backed TCP transport. The transport owns its own multi-threaded
//! runtime, so the application tick stays synchronous: `connect`, `send` and
//! `disconnect` only hand work to background tasks, and everything the tasks
//! observe comes back through the event queues drained by `poll`.
//!
//! Each link runs two tasks:
//! - a reader pushing received chunks as `DataReceived` events
//! - a writer draining an unbounded channel of outgoing batches
//!
//! Dropping a link's sender lets the writer flush what is queued and shut the
//! socket down. A reader that sees the stream end while its link is still
//! registered reports a forced disconnect.
//!
//! The runtime is shut down in the background when the transport is dropped,
//! so it may be dropped from any context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DEFAULT_FRAME_SIZE_LIMIT;
use crate::error::{ProtocolError, Result};
use crate::transport::{
    ConnectionId, DisconnectKind, EventProducer, EventQueue, Peer, Role, Transport, TransportError,
    TransportEvent,
};

/// Size of the per-link read buffer
const READ_BUFFER_SIZE: usize = 4096;

struct Link {
    outgoing: mpsc::UnboundedSender<Bytes>,
    reader: AbortHandle,
}

impl Link {
    fn close(self) {
        // Dropping `outgoing` lets the writer flush and shut down
        self.reader.abort();
    }
}

type ServerLinks = Arc<Mutex<HashMap<ConnectionId, Link>>>;
type ClientLink = Arc<Mutex<Option<Link>>>;

pub struct TcpTransport {
    runtime: Option<Runtime>,
    frame_size_limit: u32,
    server_events: EventQueue,
    client_events: EventQueue,
    links: ServerLinks,
    client_link: ClientLink,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    next_id: Arc<AtomicU32>,
}

impl TcpTransport {
    /// Create a transport with the default 1024-byte frame size limit
    pub fn new() -> Result<Self> {
        Self::with_frame_size_limit(DEFAULT_FRAME_SIZE_LIMIT)
    }

    pub fn with_frame_size_limit(frame_size_limit: u32) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("blitnet-tcp")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime: Some(runtime),
            frame_size_limit,
            server_events: EventQueue::new(),
            client_events: EventQueue::new(),
            links: Arc::new(Mutex::new(HashMap::new())),
            client_link: Arc::new(Mutex::new(None)),
            accept_task: Mutex::new(None),
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| ProtocolError::TransportError("runtime is shut down".to_string()))
    }

    /// Bind `address` and start accepting clients. Returns the bound address,
    /// which is useful when binding port 0.
    #[instrument(skip(self))]
    pub fn start_server(&self, address: &str) -> Result<SocketAddr> {
        let mut accept_task = self
            .accept_task
            .lock()
            .map_err(|_| ProtocolError::TransportError("accept lock poisoned".to_string()))?;
        if accept_task.is_some() {
            return Err(ProtocolError::TransportError(
                "server already started".to_string(),
            ));
        }

        let std_listener = std::net::TcpListener::bind(address)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = self.runtime()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        *accept_task = Some(runtime.spawn(accept_loop(
            listener,
            self.links.clone(),
            self.next_id.clone(),
            self.server_events.producer(),
        )));

        info!(address = %local_addr, "TCP server listening");
        Ok(local_addr)
    }

    /// Stop accepting and close every client link
    pub fn stop_server(&self) {
        let task = self.accept_task.lock().ok().and_then(|mut task| task.take());
        let Some(task) = task else {
            return;
        };
        task.abort();

        let links: Vec<(ConnectionId, Link)> = match self.links.lock() {
            Ok(mut links) => links.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (id, link) in links {
            link.close();
            self.server_events.push(TransportEvent::Disconnected(
                Peer::Client(id),
                DisconnectKind::SelfInitiated,
            ));
        }

        info!("TCP server stopped");
    }

    pub fn is_server_started(&self) -> bool {
        self.accept_task
            .lock()
            .map(|task| task.is_some())
            .unwrap_or(false)
    }

    pub fn is_client_connected(&self) -> bool {
        self.client_link
            .lock()
            .map(|link| link.is_some())
            .unwrap_or(false)
    }
}

impl Transport for TcpTransport {
    fn frame_size_limit(&self) -> u32 {
        self.frame_size_limit
    }

    #[instrument(skip(self))]
    fn connect(&self, address: &str) -> Result<()> {
        if self.is_client_connected() {
            return Err(ProtocolError::TransportError(
                "client already connected".to_string(),
            ));
        }

        let address = address.to_string();
        let events = self.client_events.producer();
        let client_link = self.client_link.clone();

        self.runtime()?.spawn(async move {
            let stream = match TcpStream::connect(&address).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(address = %address, error = %e, "Connect failed");
                    events.push(TransportEvent::Error(TransportError::Client(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            if register_server_link(stream, &client_link, events) {
                info!(address = %address, "Connected to server");
            }
        });

        Ok(())
    }

    fn send(&self, peer: Peer, data: Bytes) -> Result<()> {
        let sent = match peer {
            Peer::Server => {
                let link = self
                    .client_link
                    .lock()
                    .map_err(|_| ProtocolError::TransportError("link lock poisoned".to_string()))?;
                match link.as_ref() {
                    Some(link) => link.outgoing.send(data).is_ok(),
                    None => return Err(ProtocolError::NotConnected),
                }
            }
            Peer::Client(id) => {
                let links = self
                    .links
                    .lock()
                    .map_err(|_| ProtocolError::TransportError("link lock poisoned".to_string()))?;
                match links.get(&id) {
                    Some(link) => link.outgoing.send(data).is_ok(),
                    None => {
                        return Err(ProtocolError::TransportError(format!(
                            "no TCP client {id}"
                        )))
                    }
                }
            }
        };

        if !sent {
            // The writer is gone; the reader will report the disconnect
            debug!(peer = %peer, "Dropped send to closing link");
        }
        Ok(())
    }

    fn disconnect(&self, peer: Peer) {
        let (link, events) = match peer {
            Peer::Server => (
                self.client_link.lock().ok().and_then(|mut link| link.take()),
                &self.client_events,
            ),
            Peer::Client(id) => (
                self.links.lock().ok().and_then(|mut links| links.remove(&id)),
                &self.server_events,
            ),
        };

        if let Some(link) = link {
            link.close();
            events.push(TransportEvent::Disconnected(
                peer,
                DisconnectKind::SelfInitiated,
            ));
            debug!(peer = %peer, "TCP link closed");
        }
    }

    fn poll(&self, role: Role, events: &mut Vec<TransportEvent>) {
        match role {
            Role::Server => self.server_events.drain_into(events),
            Role::Client => self.client_events.drain_into(events),
        };
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    links: ServerLinks,
    next_id: Arc<AtomicU32>,
    events: EventProducer,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Error accepting connection");
                events.push(TransportEvent::Error(TransportError::Server(e.to_string())));
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
        register_client_link(id, stream, &links, &events);
        info!(peer = %addr, connection = %id, "New connection established");
    }
}

/// Install the client's link to the server. Returns false if one already exists.
fn register_server_link(stream: TcpStream, client_link: &ClientLink, events: EventProducer) -> bool {
    let Ok(mut slot) = client_link.lock() else {
        return false;
    };
    if slot.is_some() {
        events.push(TransportEvent::Error(TransportError::Client(
            "client already connected".to_string(),
        )));
        return false;
    }

    let (read_half, write_half) = stream.into_split();
    let (outgoing, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, rx));

    // Connected must be queued before any data the reader pushes
    events.push(TransportEvent::Connected(Peer::Server));

    let unregister = {
        let client_link = client_link.clone();
        move || {
            client_link
                .lock()
                .map(|mut link| link.take().is_some())
                .unwrap_or(false)
        }
    };
    let reader = tokio::spawn(read_loop(
        read_half,
        Peer::Server,
        events,
        unregister,
        TransportError::Client,
    ));

    *slot = Some(Link {
        outgoing,
        reader: reader.abort_handle(),
    });
    true
}

fn register_client_link(id: ConnectionId, stream: TcpStream, links: &ServerLinks, events: &EventProducer) {
    let Ok(mut registered) = links.lock() else {
        return;
    };

    let (read_half, write_half) = stream.into_split();
    let (outgoing, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, rx));

    events.push(TransportEvent::Connected(Peer::Client(id)));

    let unregister = {
        let links = links.clone();
        move || {
            links
                .lock()
                .map(|mut links| links.remove(&id).is_some())
                .unwrap_or(false)
        }
    };
    let reader = tokio::spawn(read_loop(
        read_half,
        Peer::Client(id),
        events.clone(),
        unregister,
        move |message| TransportError::Connection { id, message },
    ));

    registered.insert(
        id,
        Link {
            outgoing,
            reader: reader.abort_handle(),
        },
    );
}

async fn read_loop<U, E>(
    mut reader: OwnedReadHalf,
    peer: Peer,
    events: EventProducer,
    unregister: U,
    make_error: E,
) where
    U: FnOnce() -> bool,
    E: Fn(String) -> TransportError,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    let failure = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break None,
            Ok(n) => {
                events.push(TransportEvent::DataReceived(
                    peer,
                    Bytes::copy_from_slice(&buffer[..n]),
                ));
            }
            Err(e) => break Some(e),
        }
    };

    // A link already removed was closed locally and has reported itself
    if unregister() {
        if let Some(e) = failure {
            warn!(peer = %peer, error = %e, "TCP read failed");
            events.push(TransportEvent::Error(make_error(e.to_string())));
        }
        events.push(TransportEvent::Disconnected(peer, DisconnectKind::Forced));
        info!(peer = %peer, "Connection closed by remote");
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = outgoing.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(error = %e, "TCP write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
