//! # Network Application
//!
//! The application context wires one transport to an optional server role,
//! an optional client role, the replication registry, the writer pool and
//! diagnostics. Nothing here is global: two applications in one process (a
//! server and a client over [`LocalTransport`](crate::transport::local::LocalTransport),
//! say) are fully independent.
//!
//! ## Tick
//! The application is driven by an external tick. Each phase runs for every
//! connection before the next phase starts:
//!
//! 1. [`send_all`](NetworkApplication::send_all): flush every connection's batcher
//! 2. [`poll_transport`](NetworkApplication::poll_transport): drain transport
//!    events (connects, received chunks, disconnects, errors)
//! 3. [`handle_all`](NetworkApplication::handle_all): dispatch every complete
//!    received frame
//!
//! [`tick`](NetworkApplication::tick) runs the three phases and then the
//! behaviour update hooks. Closed connections are pruned after phases 2 and 3:
//! they leave their dispatcher and every replication scope, and the
//! behaviours get `on_disconnect`.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use blitnet::app::NetworkApplication;
//! use blitnet::transport::local::LocalTransport;
//!
//! let hub = Arc::new(LocalTransport::new());
//! let mut server = NetworkApplication::new(hub.clone());
//! server.start_server().unwrap();
//!
//! let mut client = NetworkApplication::new(Arc::new(hub.endpoint()));
//! client.start_client().unwrap();
//! client.connect("local").unwrap();
//!
//! server.tick();
//! client.tick();
//! assert_eq!(server.server().unwrap().len(), 1);
//! assert!(client.is_client_connected());
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::constants::{ERR_CLIENT_NOT_STARTED, ERR_SERVER_NOT_STARTED};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use crate::protocol::dispatcher::{ClientDispatcher, Dispatcher, HandlerIdEncoding, ServerDispatcher};
use crate::sync::SyncRegistry;
use crate::transport::{DisconnectKind, Peer, Role, Transport, TransportError, TransportEvent};
use crate::utils::buffer_pool::WriterPool;
use crate::utils::metrics::Diagnostics;

/// User code driven by the application
///
/// Every hook has an empty default, so a behaviour implements only what it
/// needs. Hooks get the shared context and may register handlers, send, or
/// create replicated objects through it.
pub trait NetworkBehaviour: Send {
    /// A client connected to this server
    fn on_server_connect(&mut self, _ctx: &NetworkContext, _connection: &Arc<Connection>) {}

    /// This client connected to a server
    fn on_client_connect(&mut self, _ctx: &NetworkContext, _connection: &Arc<Connection>) {}

    /// A connection of either role closed
    fn on_disconnect(&mut self, _ctx: &NetworkContext, _connection: &Arc<Connection>, _kind: DisconnectKind) {}

    fn on_transport_error(&mut self, _ctx: &NetworkContext, _error: &TransportError) {}

    /// Called every tick while the server role runs
    fn server_update(&mut self, _ctx: &NetworkContext) {}

    /// Called every tick while the client role runs
    fn client_update(&mut self, _ctx: &NetworkContext) {}
}

/// Shared state handed to behaviours
pub struct NetworkContext {
    transport: Arc<dyn Transport>,
    server: Option<ServerDispatcher>,
    client: Option<ClientDispatcher>,
    registry: SyncRegistry,
    pool: WriterPool,
    diagnostics: Arc<Diagnostics>,
    encoding: HandlerIdEncoding,
}

impl NetworkContext {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn server(&self) -> Option<&ServerDispatcher> {
        self.server.as_ref()
    }

    pub fn client(&self) -> Option<&ClientDispatcher> {
        self.client.as_ref()
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WriterPool {
        &self.pool
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_client_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|client| client.is_connected())
    }

    /// Every connection of both roles
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self
            .server
            .as_ref()
            .map(|server| server.connections())
            .unwrap_or_default();
        connections.extend(self.client.as_ref().and_then(|client| client.connection()));
        connections
    }

    fn new_dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.encoding, self.pool.clone(), self.diagnostics.clone())
    }
}

/// Application context and tick driver
pub struct NetworkApplication {
    context: NetworkContext,
    behaviours: Vec<Box<dyn NetworkBehaviour>>,
    events: Vec<TransportEvent>,
}

impl NetworkApplication {
    /// Create an application with default settings and no roles started
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, &NetworkConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: &NetworkConfig) -> Self {
        let pool = WriterPool::with_limits(
            config.pool.preallocated_writers,
            config.pool.writer_capacity,
            config.pool.max_pooled_capacity,
        );
        let diagnostics = Arc::new(Diagnostics::new());
        diagnostics.set_recording(config.dispatcher.record_diagnostics);

        let encoding = config.dispatcher.handler_ids;
        let registry = SyncRegistry::new(encoding, pool.clone(), diagnostics.clone());

        Self {
            context: NetworkContext {
                transport,
                server: None,
                client: None,
                registry,
                pool,
                diagnostics,
                encoding,
            },
            behaviours: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    pub fn add_behaviour<B: NetworkBehaviour + 'static>(&mut self, behaviour: B) {
        self.behaviours.push(Box::new(behaviour));
    }

    /// Start (or restart) the server role with a fresh dispatcher
    pub fn start_server(&mut self) -> Result<()> {
        self.stop_server();

        let dispatcher = ServerDispatcher::new(self.context.new_dispatcher());
        self.context.registry.attach_server(&dispatcher)?;
        self.context.server = Some(dispatcher);
        info!(encoding = ?self.context.encoding, "Server role started");
        Ok(())
    }

    /// Disconnect every client and drop the server role
    pub fn stop_server(&mut self) {
        let Some(server) = self.context.server.as_ref() else {
            return;
        };
        server.disconnect_all();
        self.prune();

        if let Some(server) = self.context.server.take() {
            self.context.registry.detach_server(&server);
        }
        info!("Server role stopped");
    }

    /// Start (or restart) the client role with a fresh dispatcher
    pub fn start_client(&mut self) -> Result<()> {
        self.stop_client();

        let dispatcher = ClientDispatcher::new(self.context.new_dispatcher());
        self.context.registry.attach_client(&dispatcher)?;
        self.context.client = Some(dispatcher);
        info!(encoding = ?self.context.encoding, "Client role started");
        Ok(())
    }

    /// Disconnect from the server and drop the client role
    pub fn stop_client(&mut self) {
        if self.context.client.is_none() {
            return;
        }
        self.disconnect();

        if let Some(client) = self.context.client.take() {
            self.context.registry.detach_client(&client);
        }
        info!("Client role stopped");
    }

    /// Connect the client role to `address`. The connection exists once the
    /// transport reports it, during a later `poll_transport`.
    pub fn connect(&self, address: &str) -> Result<()> {
        if self.context.client.is_none() {
            return Err(ProtocolError::Custom(ERR_CLIENT_NOT_STARTED.to_string()));
        }
        self.context.transport.connect(address)
    }

    /// Close the client's connection to the server
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.context.client.as_ref().and_then(|c| c.connection()) {
            connection.disconnect();
        }
        self.prune();
    }

    /// Stop both roles and log the final diagnostics
    pub fn shutdown(&mut self) {
        self.stop_client();
        self.stop_server();
        self.context.diagnostics.log_diagnostics();
    }

    /// Queue `payload` for `handler` on every client
    pub fn send_to_clients(&self, handler: &str, payload: &[u8]) -> Result<usize> {
        let server = self
            .context
            .server
            .as_ref()
            .ok_or_else(|| ProtocolError::Custom(ERR_SERVER_NOT_STARTED.to_string()))?;
        Ok(server.send_all(handler, payload))
    }

    /// Phase 1: hand every pending batch to the transport. Returns the number
    /// of batches sent.
    pub fn send_all(&self) -> usize {
        let mut batches = 0;
        for connection in self.context.connections() {
            match connection.flush() {
                Ok(sent) => batches += sent,
                Err(e) => {
                    self.context.diagnostics.transport_error();
                    warn!(connection = %connection.key(), peer = %connection.peer(), error = %e, "Failed to send batches");
                }
            }
        }
        batches
    }

    /// Phase 2: drain and route transport events
    pub fn poll_transport(&mut self) {
        let mut events = std::mem::take(&mut self.events);

        if self.context.server.is_some() {
            self.context.transport.poll(Role::Server, &mut events);
            for event in events.drain(..) {
                self.route_server_event(event);
            }
        }
        if self.context.client.is_some() {
            self.context.transport.poll(Role::Client, &mut events);
            for event in events.drain(..) {
                self.route_client_event(event);
            }
        }

        self.events = events;
        self.prune();
    }

    /// Phase 3: dispatch every complete received frame
    pub fn handle_all(&mut self) {
        let context = &self.context;

        if let Some(server) = context.server.as_ref() {
            for connection in server.connections() {
                if let Err(e) = connection.handle_received(|c, frame| server.process(c, frame)) {
                    context.diagnostics.protocol_error();
                    debug!(connection = %connection.key(), error = %e, "Receive stream rejected");
                }
            }
        }

        if let Some(client) = context.client.as_ref() {
            if let Some(connection) = client.connection() {
                if let Err(e) = connection.handle_received(|c, frame| client.process(c, frame)) {
                    context.diagnostics.protocol_error();
                    debug!(connection = %connection.key(), error = %e, "Receive stream rejected");
                }
            }
        }

        self.prune();
    }

    /// Run the behaviours' update hooks for the active roles
    pub fn update(&mut self) {
        let Self {
            context,
            behaviours,
            ..
        } = self;

        if context.is_server() {
            for behaviour in behaviours.iter_mut() {
                behaviour.server_update(context);
            }
        }
        if context.is_client() {
            for behaviour in behaviours.iter_mut() {
                behaviour.client_update(context);
            }
        }
    }

    /// One full tick: send, poll, handle, update
    pub fn tick(&mut self) {
        self.send_all();
        self.poll_transport();
        self.handle_all();
        self.update();
    }

    fn route_server_event(&mut self, event: TransportEvent) {
        let Self {
            context,
            behaviours,
            ..
        } = self;
        let Some(server) = context.server.as_ref() else {
            return;
        };

        match event {
            TransportEvent::Connected(peer @ Peer::Client(id)) => {
                let connection = Arc::new(Connection::new(
                    peer,
                    context.transport.clone(),
                    context.pool.clone(),
                ));
                if let Err(e) = server.add_connection(id, connection.clone()) {
                    error!(peer = %peer, error = %e, "Ignoring connect event");
                    return;
                }
                context.diagnostics.connection_established();
                info!(connection = %connection.key(), peer = %peer, "Client connected");

                for behaviour in behaviours.iter_mut() {
                    behaviour.on_server_connect(context, &connection);
                }
            }
            TransportEvent::DataReceived(peer @ Peer::Client(id), data) => {
                match server.connection(id) {
                    Some(connection) => {
                        if let Err(e) = connection.enqueue_received(&data) {
                            trace!(peer = %peer, error = %e, bytes = data.len(), "Discarded data for closing connection");
                        }
                    }
                    None => trace!(peer = %peer, bytes = data.len(), "Discarded data for unknown connection"),
                }
            }
            TransportEvent::Disconnected(Peer::Client(id), kind) => {
                if let Some(connection) = server.connection(id) {
                    match kind {
                        DisconnectKind::Forced => {
                            connection.forced_disconnect(|c, frame| server.process(c, frame))
                        }
                        DisconnectKind::SelfInitiated => connection.disconnect(),
                    }
                }
            }
            TransportEvent::Error(error) => report_transport_error(context, behaviours, &error),
            other => warn!(event = ?other, "Unexpected event for the server role"),
        }
    }

    fn route_client_event(&mut self, event: TransportEvent) {
        let Self {
            context,
            behaviours,
            ..
        } = self;
        let Some(client) = context.client.as_ref() else {
            return;
        };

        match event {
            TransportEvent::Connected(Peer::Server) => {
                let connection = Arc::new(Connection::new(
                    Peer::Server,
                    context.transport.clone(),
                    context.pool.clone(),
                ));
                client.set_connection(connection.clone());
                context.registry.set_server_link(Some(connection.clone()));
                context.diagnostics.connection_established();
                info!(connection = %connection.key(), "Connected to server");

                for behaviour in behaviours.iter_mut() {
                    behaviour.on_client_connect(context, &connection);
                }
            }
            TransportEvent::DataReceived(Peer::Server, data) => match client.connection() {
                Some(connection) => {
                    if let Err(e) = connection.enqueue_received(&data) {
                        trace!(error = %e, bytes = data.len(), "Discarded data for closing connection");
                    }
                }
                None => trace!(bytes = data.len(), "Discarded data without a server connection"),
            },
            TransportEvent::Disconnected(Peer::Server, kind) => {
                if let Some(connection) = client.connection() {
                    match kind {
                        DisconnectKind::Forced => {
                            connection.forced_disconnect(|c, frame| client.process(c, frame))
                        }
                        DisconnectKind::SelfInitiated => connection.disconnect(),
                    }
                }
            }
            TransportEvent::Error(error) => report_transport_error(context, behaviours, &error),
            other => warn!(event = ?other, "Unexpected event for the client role"),
        }
    }

    /// Remove closed connections and notify the behaviours
    fn prune(&mut self) {
        let Self {
            context,
            behaviours,
            ..
        } = self;

        let mut closed = context
            .server
            .as_ref()
            .map(|server| server.remove_inactive())
            .unwrap_or_default();
        if let Some(client) = context.client.as_ref() {
            if client.connection().is_some_and(|c| !c.is_active()) {
                closed.extend(client.clear_connection());
            }
        }

        for connection in closed {
            context.registry.forget_connection(connection.key());
            context.diagnostics.connection_closed();

            let kind = connection
                .disconnect_kind()
                .unwrap_or(DisconnectKind::SelfInitiated);
            info!(connection = %connection.key(), peer = %connection.peer(), kind = ?kind, "Connection removed");

            for behaviour in behaviours.iter_mut() {
                behaviour.on_disconnect(context, &connection, kind);
            }
        }
    }
}

impl std::ops::Deref for NetworkApplication {
    type Target = NetworkContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

fn report_transport_error(
    context: &NetworkContext,
    behaviours: &mut [Box<dyn NetworkBehaviour>],
    error: &TransportError,
) {
    context.diagnostics.transport_error();
    warn!(error = %error, "Transport error");
    for behaviour in behaviours.iter_mut() {
        behaviour.on_transport_error(context, error);
    }
}
