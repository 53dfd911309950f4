//! # Sync Registry
//!
//! Maps owners to their replicated objects and to the connections observing
//! them, and holds the local write authority (server role, client role and the
//! link to the server).
//!
//! The registry is a cloneable handle. It is created by the application
//! context and passed to every replicated object, so there is no process-wide
//! table and two applications in one process never see each other's objects.
//!
//! ## Locking
//! The registry lock is never held while a [`SyncState`] applies an operation
//! or while a sub-message is queued on a connection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};

use crate::core::batcher::FRAME_HEADER_SIZE;
use crate::core::reader::NetworkReader;
use crate::core::writer::NetworkWriter;
use crate::error::constants::{
    ERR_CLIENT_WRITE_SERVER_OWNED, ERR_NOT_OWNER_CONNECTION, ERR_REGISTRY_LOCK,
    ERR_WRITE_REQUIRES_CLIENT, ERR_WRITE_REQUIRES_SERVER,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionKey};
use crate::protocol::dispatcher::{ClientDispatcher, Dispatcher, HandlerIdEncoding, ServerDispatcher};
use crate::sync::object::SyncObject;
use crate::sync::{OwnerId, SyncMode, SyncState, MAX_SYNC_OBJECTS, SYNC_HANDLER};
use crate::utils::buffer_pool::{PooledWriter, WriterPool};
use crate::utils::metrics::Diagnostics;

/// Owner id plus object id in front of every operation
const ENVELOPE_SIZE: usize = 5;

struct Slot {
    mode: SyncMode,
    state: Arc<dyn SyncState>,
    owner_connections: HashSet<ConnectionKey>,
}

#[derive(Default)]
struct Authority {
    server: bool,
    client: bool,
    server_link: Option<Arc<Connection>>,
}

#[derive(Default)]
struct RegistryState {
    objects: HashMap<OwnerId, BTreeMap<u8, Slot>>,
    scopes: HashMap<OwnerId, Vec<Arc<Connection>>>,
    authority: Authority,
}

/// Shared registry of replicated objects
#[derive(Clone)]
pub struct SyncRegistry {
    state: Arc<Mutex<RegistryState>>,
    sender: Arc<Dispatcher>,
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new(
            HandlerIdEncoding::Name,
            WriterPool::default(),
            Arc::new(Diagnostics::new()),
        )
    }
}

impl SyncRegistry {
    /// Create an empty registry. Outgoing operations use `encoding` for the
    /// handler id, which must match the peers' dispatchers.
    pub fn new(encoding: HandlerIdEncoding, pool: WriterPool, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            sender: Arc::new(Dispatcher::new(encoding, pool, diagnostics)),
        }
    }

    /// Pool outgoing operations are built in
    pub fn pool(&self) -> &WriterPool {
        self.sender.pool()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::Custom(ERR_REGISTRY_LOCK.to_string()))
    }

    /// Add `state` under `owner` with the first free id
    ///
    /// # Errors
    /// [`ProtocolError::SyncCapacityExceeded`] if the owner already has 255 objects.
    pub fn register(&self, owner: OwnerId, mode: SyncMode, state: Arc<dyn SyncState>) -> Result<SyncObject> {
        let mut inner = self.lock()?;
        let slots = inner.objects.entry(owner).or_default();

        let id = (0..MAX_SYNC_OBJECTS)
            .map(|id| id as u8)
            .find(|id| !slots.contains_key(id))
            .ok_or(ProtocolError::SyncCapacityExceeded(owner.0))?;

        slots.insert(
            id,
            Slot {
                mode,
                state,
                owner_connections: HashSet::new(),
            },
        );
        debug!(owner = %owner, sync_id = id, mode = %mode, "Sync object registered");
        drop(inner);

        Ok(SyncObject::new(self.clone(), owner, id, mode))
    }

    /// Remove an object. The owner's entry goes away with its last object.
    pub fn unregister(&self, owner: OwnerId, id: u8) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        let Some(slots) = inner.objects.get_mut(&owner) else {
            return false;
        };
        let removed = slots.remove(&id).is_some();
        if slots.is_empty() {
            inner.objects.remove(&owner);
        }
        if removed {
            debug!(owner = %owner, sync_id = id, "Sync object disposed");
        }
        removed
    }

    pub fn contains(&self, owner: OwnerId, id: u8) -> bool {
        self.lock()
            .map(|inner| {
                inner
                    .objects
                    .get(&owner)
                    .is_some_and(|slots| slots.contains_key(&id))
            })
            .unwrap_or(false)
    }

    /// Number of live objects of `owner`
    pub fn object_count(&self, owner: OwnerId) -> usize {
        self.lock()
            .map(|inner| inner.objects.get(&owner).map_or(0, |slots| slots.len()))
            .unwrap_or(0)
    }

    /// Every owner with at least one live object
    pub fn owners(&self) -> Vec<OwnerId> {
        self.lock()
            .map(|inner| inner.objects.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn set_server(&self, enabled: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.authority.server = enabled;
        }
    }

    pub fn set_client(&self, enabled: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.authority.client = enabled;
        }
    }

    pub fn is_server(&self) -> bool {
        self.lock().map(|inner| inner.authority.server).unwrap_or(false)
    }

    pub fn is_client(&self) -> bool {
        self.lock().map(|inner| inner.authority.client).unwrap_or(false)
    }

    /// Connection client-owned writes are sent on when this process is not a server
    pub fn set_server_link(&self, connection: Option<Arc<Connection>>) {
        if let Ok(mut inner) = self.lock() {
            inner.authority.server_link = connection;
        }
    }

    pub fn server_link(&self) -> Option<Arc<Connection>> {
        self.lock()
            .ok()
            .and_then(|inner| inner.authority.server_link.clone())
    }

    /// Install the server-side handler and take the server role
    pub fn attach_server(&self, dispatcher: &ServerDispatcher) -> Result<()> {
        let registry = self.clone();
        dispatcher.register(SYNC_HANDLER, move |connection, payload| {
            registry.handle_from_client(connection, payload)
        })?;
        self.set_server(true);
        Ok(())
    }

    pub fn detach_server(&self, dispatcher: &ServerDispatcher) {
        dispatcher.remove(SYNC_HANDLER);
        self.set_server(false);
    }

    /// Install the client-side handler and take the client role
    pub fn attach_client(&self, dispatcher: &ClientDispatcher) -> Result<()> {
        let registry = self.clone();
        dispatcher.register(SYNC_HANDLER, move |connection, payload| {
            registry.handle_from_server(connection, payload)
        })?;
        self.set_client(true);
        Ok(())
    }

    pub fn detach_client(&self, dispatcher: &ClientDispatcher) {
        dispatcher.remove(SYNC_HANDLER);
        self.set_client(false);
        self.set_server_link(None);
    }

    /// Add `connection` to the scope of `owner` and send it an `Init` for
    /// every live object of that owner. Adding an observer twice only
    /// resends the state.
    ///
    /// # Errors
    /// [`ProtocolError::OversizedPayload`] if any `Init` cannot fit in one
    /// frame on `connection`. The connection is not added to the scope then.
    #[instrument(skip(self, connection), fields(owner = %owner, connection = %connection.key()))]
    pub fn add_observer(&self, owner: OwnerId, connection: Arc<Connection>) -> Result<()> {
        let states: Vec<(u8, Arc<dyn SyncState>)> = {
            let inner = self.lock()?;
            inner
                .objects
                .get(&owner)
                .map(|slots| {
                    slots
                        .iter()
                        .map(|(id, slot)| (*id, slot.state.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut inits = Vec::with_capacity(states.len());
        for (id, state) in states {
            let init = self.encode_init(owner, id, state.as_ref())?;
            self.check_fits(&connection, init.position() - ENVELOPE_SIZE)?;
            inits.push(init);
        }

        {
            let mut inner = self.lock()?;
            let scope = inner.scopes.entry(owner).or_default();
            if !scope.iter().any(|c| c.key() == connection.key()) {
                scope.push(connection.clone());
            }
        }

        for init in inits {
            self.sender.send(&connection, SYNC_HANDLER, init.as_slice())?;
        }
        debug!("Observer added");
        Ok(())
    }

    pub fn remove_observer(&self, owner: OwnerId, key: ConnectionKey) -> bool {
        let Ok(mut inner) = self.lock() else {
            return false;
        };
        let Some(scope) = inner.scopes.get_mut(&owner) else {
            return false;
        };
        let before = scope.len();
        scope.retain(|c| c.key() != key);
        let removed = scope.len() != before;
        if scope.is_empty() {
            inner.scopes.remove(&owner);
        }
        removed
    }

    pub fn observers(&self, owner: OwnerId) -> Vec<Arc<Connection>> {
        self.lock()
            .ok()
            .and_then(|inner| inner.scopes.get(&owner).cloned())
            .unwrap_or_default()
    }

    /// Drop a closed connection from every scope, every owner set and the
    /// server link
    pub fn forget_connection(&self, key: ConnectionKey) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        inner.scopes.retain(|_, scope| {
            scope.retain(|c| c.key() != key);
            !scope.is_empty()
        });
        for slots in inner.objects.values_mut() {
            for slot in slots.values_mut() {
                slot.owner_connections.remove(&key);
            }
        }
        if inner
            .authority
            .server_link
            .as_ref()
            .is_some_and(|link| link.key() == key)
        {
            inner.authority.server_link = None;
        }
        trace!(connection = %key, "Connection forgotten by sync registry");
    }

    /// Send the full state of one object to `connection`
    pub fn send_init_data(&self, owner: OwnerId, id: u8, connection: &Connection) -> Result<()> {
        let state = self.with_slot(owner, id, |slot| Ok(slot.state.clone()))?;
        self.send_init(owner, id, state.as_ref(), connection)
    }

    fn send_init(&self, owner: OwnerId, id: u8, state: &dyn SyncState, connection: &Connection) -> Result<()> {
        let init = self.encode_init(owner, id, state)?;
        self.sender.send(connection, SYNC_HANDLER, init.as_slice())
    }

    fn encode_init(&self, owner: OwnerId, id: u8, state: &dyn SyncState) -> Result<PooledWriter> {
        let mut writer = self.sender.pool().acquire();
        write_header(&mut writer, owner, id);
        state.write_init(&mut writer)?;
        Ok(writer)
    }

    fn with_slot<R>(&self, owner: OwnerId, id: u8, f: impl FnOnce(&mut Slot) -> Result<R>) -> Result<R> {
        let mut inner = self.lock()?;
        let slot = inner
            .objects
            .get_mut(&owner)
            .and_then(|slots| slots.get_mut(&id))
            .ok_or(ProtocolError::UnknownSyncObject { owner: owner.0, id })?;
        f(slot)
    }

    fn client_owned_slot<R>(&self, owner: OwnerId, id: u8, f: impl FnOnce(&mut Slot) -> R) -> Result<R> {
        self.with_slot(owner, id, |slot| {
            if slot.mode != SyncMode::ClientOwner {
                return Err(ProtocolError::WrongSyncMode {
                    member: "owner_connections",
                    expected: SyncMode::ClientOwner.as_str(),
                });
            }
            Ok(f(slot))
        })
    }

    pub fn add_owner_connection(&self, owner: OwnerId, id: u8, connection: &Connection) -> Result<()> {
        self.client_owned_slot(owner, id, |slot| {
            slot.owner_connections.insert(connection.key());
        })
    }

    pub fn remove_owner_connection(&self, owner: OwnerId, id: u8, connection: &Connection) -> Result<bool> {
        self.client_owned_slot(owner, id, |slot| {
            slot.owner_connections.remove(&connection.key())
        })
    }

    pub fn is_owner_connection(&self, owner: OwnerId, id: u8, connection: &Connection) -> Result<bool> {
        self.client_owned_slot(owner, id, |slot| {
            slot.owner_connections.contains(&connection.key())
        })
    }

    /// Fail unless this process may write objects of `mode`
    pub fn check_write(&self, mode: SyncMode) -> Result<()> {
        let inner = self.lock()?;
        match mode {
            SyncMode::ServerOwner if !inner.authority.server => Err(ProtocolError::Unauthorized(
                ERR_WRITE_REQUIRES_SERVER.to_string(),
            )),
            SyncMode::ClientOwner if !inner.authority.client => Err(ProtocolError::Unauthorized(
                ERR_WRITE_REQUIRES_CLIENT.to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Connections an operation on an object of `owner` and `mode` goes to
    ///
    /// A server sends to every observer in the owner's scope. A client that is
    /// not also the server sends to the server, which relays.
    fn targets(&self, owner: OwnerId, mode: SyncMode) -> Result<Vec<Arc<Connection>>> {
        let inner = self.lock()?;
        let targets = if mode == SyncMode::ServerOwner || inner.authority.server {
            inner.scopes.get(&owner).cloned().unwrap_or_default()
        } else {
            inner.authority.server_link.iter().cloned().collect()
        };
        Ok(targets)
    }

    /// Fail unless an operation of `operation_len` bytes, in its envelope and
    /// sub-message, fits in one frame on `connection`
    fn check_fits(&self, connection: &Connection, operation_len: usize) -> Result<()> {
        let size = self
            .sender
            .sub_message_size(SYNC_HANDLER, ENVELOPE_SIZE + operation_len);
        if size > connection.max_payload() {
            return Err(ProtocolError::OversizedPayload {
                size: size + FRAME_HEADER_SIZE,
                threshold: connection.max_payload() + FRAME_HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Fail unless this process may write objects of `mode` and an operation
    /// of `operation_len` bytes fits on every current target. Call before
    /// mutating so a refused operation leaves the state untouched.
    pub fn check_publish(&self, owner: OwnerId, mode: SyncMode, operation_len: usize) -> Result<()> {
        self.check_write(mode)?;
        for connection in self.targets(owner, mode)?.iter().filter(|c| c.is_active()) {
            self.check_fits(connection, operation_len)?;
        }
        Ok(())
    }

    /// Wrap `operation` in the envelope of `(owner, id)` and send it
    ///
    /// Nothing is sent unless the operation fits on every target. Returns
    /// the number of connections the operation was queued on.
    pub fn publish(&self, owner: OwnerId, id: u8, mode: SyncMode, operation: &[u8]) -> Result<usize> {
        self.check_write(mode)?;

        let targets: Vec<Arc<Connection>> = self
            .targets(owner, mode)?
            .into_iter()
            .filter(|c| c.is_active())
            .collect();
        for connection in &targets {
            self.check_fits(connection, operation.len())?;
        }

        let mut writer = self.sender.pool().acquire();
        write_header(&mut writer, owner, id);
        writer.write_bytes(operation);

        let mut sent = 0;
        for connection in &targets {
            match self.sender.send(connection, SYNC_HANDLER, writer.as_slice()) {
                Ok(()) => sent += 1,
                Err(ProtocolError::ConnectionInactive) => {
                    debug!(owner = %owner, sync_id = id, connection = %connection.key(), "Skipped closing sync target")
                }
                Err(e) => {
                    warn!(owner = %owner, sync_id = id, connection = %connection.key(), error = %e, "Failed to queue sync operation")
                }
            }
        }
        trace!(owner = %owner, sync_id = id, targets = sent, bytes = operation.len(), "Sync operation published");
        Ok(sent)
    }

    /// Apply an operation received from the server
    pub fn handle_from_server(&self, connection: &Connection, payload: Bytes) -> Result<()> {
        let mut reader = NetworkReader::new(payload);
        let (owner, id) = read_header(&mut reader)?;
        let state = self.with_slot(owner, id, |slot| Ok(slot.state.clone()))?;

        state.apply(&mut reader, Some(connection))?;
        trace!(owner = %owner, sync_id = id, "Sync operation applied");
        Ok(())
    }

    /// Check, apply and relay an operation received from a client
    ///
    /// Only client-owned objects accept client writes, and only from an owner
    /// connection. The operation is relayed unchanged to every other observer
    /// once it has been applied.
    pub fn handle_from_client(&self, connection: &Connection, payload: Bytes) -> Result<()> {
        let mut reader = NetworkReader::new(payload.clone());
        let (owner, id) = read_header(&mut reader)?;

        let (state, relay) = {
            let mut inner = self.lock()?;
            let slot = inner
                .objects
                .get_mut(&owner)
                .and_then(|slots| slots.get_mut(&id))
                .ok_or(ProtocolError::UnknownSyncObject { owner: owner.0, id })?;

            if slot.mode != SyncMode::ClientOwner {
                return Err(ProtocolError::Unauthorized(
                    ERR_CLIENT_WRITE_SERVER_OWNED.to_string(),
                ));
            }
            if !slot.owner_connections.contains(&connection.key()) {
                return Err(ProtocolError::Unauthorized(format!(
                    "{ERR_NOT_OWNER_CONNECTION}: {owner} sync id {id}"
                )));
            }

            let state = slot.state.clone();
            let relay: Vec<Arc<Connection>> = inner
                .scopes
                .get(&owner)
                .map(|scope| {
                    scope
                        .iter()
                        .filter(|c| c.key() != connection.key() && c.is_active())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (state, relay)
        };

        state.apply(&mut reader, Some(connection))?;

        for target in relay {
            if let Err(e) = self.sender.send(&target, SYNC_HANDLER, &payload) {
                debug!(owner = %owner, sync_id = id, connection = %target.key(), error = %e, "Relay skipped");
            }
        }
        trace!(owner = %owner, sync_id = id, sender = %connection.key(), "Client sync operation applied");
        Ok(())
    }
}

impl std::fmt::Debug for SyncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegistry")
            .field("owners", &self.owners())
            .field("server", &self.is_server())
            .field("client", &self.is_client())
            .finish()
    }
}

fn write_header(writer: &mut NetworkWriter, owner: OwnerId, id: u8) {
    writer.write(owner.0);
    writer.write(id);
}

fn read_header(reader: &mut NetworkReader) -> Result<(OwnerId, u8)> {
    let owner = OwnerId(reader.read::<u32>()?);
    let id = reader.read::<u8>()?;
    Ok((owner, id))
}
