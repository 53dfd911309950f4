//! # Dispatcher
//!
//! Routes the sub-messages packed into a received frame to registered handlers.
//!
//! ## Sub-message Format
//! ```text
//! [handler id] [len: i32 LE] [payload(len)]
//!
//! handler id = [len: i32 LE] [utf-8 name]     (HandlerIdEncoding::Name)
//!            | [stable_hash(name): u16 LE]    (HandlerIdEncoding::StableHash)
//! ```
//!
//! A frame may hold any number of sub-messages. Each handler gets exactly its
//! own `len` bytes, so a handler that misreads its payload cannot shift the
//! cursor for the next one.
//!
//! ## Failure Handling
//! A malformed id or length, an unknown handler, a handler error or a handler
//! panic disconnects the connection and drops the rest of that frame. Other
//! connections are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};
use zerocopy::IntoBytes;

use crate::core::reader::NetworkReader;
use crate::core::stable_hash::stable_hash;
use crate::core::writer::NetworkWriter;
use crate::error::constants::{
    ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK, ERR_NULL_HANDLER_ID,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use crate::protocol::message::NetworkMessage;
use crate::transport::ConnectionId;
use crate::utils::buffer_pool::WriterPool;
use crate::utils::metrics::Diagnostics;

pub type HandlerFn = dyn Fn(&Connection, Bytes) -> Result<()> + Send + Sync + 'static;

/// How handler ids are written on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerIdEncoding {
    /// Length-prefixed UTF-8 name
    #[default]
    Name,
    /// 16-bit stable hash of the name
    StableHash,
}

#[derive(Default)]
struct Handlers {
    by_name: HashMap<String, Arc<HandlerFn>>,
    by_hash: HashMap<u16, String>,
}

/// Handler registry plus the sub-message codec
pub struct Dispatcher {
    encoding: HandlerIdEncoding,
    handlers: Arc<RwLock<Handlers>>,
    pool: WriterPool,
    diagnostics: Arc<Diagnostics>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(
            HandlerIdEncoding::Name,
            WriterPool::default(),
            Arc::new(Diagnostics::new()),
        )
    }
}

impl Dispatcher {
    pub fn new(encoding: HandlerIdEncoding, pool: WriterPool, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            encoding,
            handlers: Arc::new(RwLock::new(Handlers::default())),
            pool,
            diagnostics,
        }
    }

    pub fn encoding(&self) -> HandlerIdEncoding {
        self.encoding
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn pool(&self) -> &WriterPool {
        &self.pool
    }

    /// Register `handler` under `name`
    ///
    /// # Errors
    /// [`ProtocolError::DuplicateHandler`] if the name is taken, or
    /// [`ProtocolError::HandlerHashCollision`] if, with stable-hash ids,
    /// another name has the same hash.
    pub fn register<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&Connection, Bytes) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        if handlers.by_name.contains_key(name) {
            return Err(ProtocolError::DuplicateHandler(name.to_string()));
        }

        if self.encoding == HandlerIdEncoding::StableHash {
            let hash = stable_hash(name);
            if let Some(existing) = handlers.by_hash.get(&hash) {
                return Err(ProtocolError::HandlerHashCollision {
                    name: name.to_string(),
                    existing: existing.clone(),
                    hash,
                });
            }
            handlers.by_hash.insert(hash, name.to_string());
        }

        handlers.by_name.insert(name.to_string(), Arc::new(handler));
        debug!(handler = %name, "Handler registered");
        Ok(())
    }

    /// Register a typed handler for `M`. Sub-messages whose length is not
    /// exactly `size_of::<M>()` are rejected.
    pub fn register_message<M, F>(&self, handler: F) -> Result<()>
    where
        M: NetworkMessage,
        F: Fn(&Connection, M) + Send + Sync + 'static,
    {
        self.register(M::NAME, move |connection, payload| {
            if payload.len() != M::SIZE {
                return Err(ProtocolError::InvalidData(format!(
                    "{} expects {} bytes, got {}",
                    M::NAME,
                    M::SIZE,
                    payload.len()
                )));
            }
            let message = NetworkReader::new(payload).read_blittable::<M>()?;
            handler(connection, message);
            Ok(())
        })
    }

    /// Remove the handler for `name`. Returns false if none was registered.
    pub fn remove(&self, name: &str) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        if handlers.by_name.remove(name).is_none() {
            return false;
        }
        handlers.by_hash.retain(|_, registered| registered != name);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.by_name.contains_key(name))
            .unwrap_or(false)
    }

    /// Append one sub-message to `writer`
    pub fn write_sub_message(
        &self,
        writer: &mut NetworkWriter,
        handler: &str,
        payload: &[u8],
    ) -> Result<()> {
        match self.encoding {
            HandlerIdEncoding::Name => writer.write_str(handler)?,
            HandlerIdEncoding::StableHash => writer.write(stable_hash(handler)),
        }
        writer.write_bytes_with_length(Some(payload))
    }

    /// Bytes [`Dispatcher::write_sub_message`] appends for a payload of
    /// `payload_len` bytes
    pub fn sub_message_size(&self, handler: &str, payload_len: usize) -> usize {
        let id = match self.encoding {
            HandlerIdEncoding::Name => 4 + handler.len(),
            HandlerIdEncoding::StableHash => 2,
        };
        id + 4 + payload_len
    }

    /// Queue `payload` for `handler` on the peer of `connection`
    pub fn send(&self, connection: &Connection, handler: &str, payload: &[u8]) -> Result<()> {
        let mut writer = self.pool.acquire();
        self.write_sub_message(&mut writer, handler, payload)?;
        connection.send(writer.as_slice())?;

        self.diagnostics.sent.try_add(handler, payload.len());
        trace!(connection = %connection.key(), handler = %handler, bytes = payload.len(), "Sub-message queued");
        Ok(())
    }

    pub fn send_message<M: NetworkMessage>(&self, connection: &Connection, message: &M) -> Result<()> {
        self.send(connection, M::NAME, message.as_bytes())
    }

    /// Dispatch every sub-message in `frame`
    ///
    /// Stops at the first failure, after disconnecting `connection`, and
    /// returns false. The caller must not dispatch further frames from this
    /// connection then, even while a forced disconnect keeps it active.
    pub fn process(&self, connection: &Connection, frame: Bytes) -> bool {
        let mut reader = NetworkReader::new(frame);

        while reader.remaining() > 0 && connection.is_active() {
            let (name, handler, payload) = match self.read_sub_message(&mut reader) {
                Ok(entry) => entry,
                Err(e) => {
                    self.reject(connection, None, &e);
                    return false;
                }
            };

            let size = payload.len();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(connection, payload)));
            match outcome {
                Ok(Ok(())) => {
                    self.diagnostics.handled.try_add(&name, size);
                }
                Ok(Err(e)) => {
                    self.reject(connection, Some(&name), &e);
                    return false;
                }
                Err(_) => {
                    self.reject(
                        connection,
                        Some(&name),
                        &ProtocolError::HandlerPanicked(name.clone()),
                    );
                    return false;
                }
            }
        }
        true
    }

    fn read_sub_message(&self, reader: &mut NetworkReader) -> Result<(String, Arc<HandlerFn>, Bytes)> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;

        let name = match self.encoding {
            HandlerIdEncoding::Name => reader
                .read_string()?
                .ok_or_else(|| ProtocolError::InvalidData(ERR_NULL_HANDLER_ID.to_string()))?,
            HandlerIdEncoding::StableHash => {
                let hash = reader.read::<u16>()?;
                handlers
                    .by_hash
                    .get(&hash)
                    .cloned()
                    .ok_or_else(|| ProtocolError::UnknownHandler(format!("{hash:#06x}")))?
            }
        };

        let handler = handlers
            .by_name
            .get(&name)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownHandler(name.clone()))?;

        let payload = reader
            .read_bytes_with_length()?
            .ok_or_else(|| ProtocolError::InvalidLength(-1))?;

        Ok((name, handler, payload))
    }

    fn reject(&self, connection: &Connection, handler: Option<&str>, err: &ProtocolError) {
        self.diagnostics.protocol_error();
        if err.is_protocol_violation() {
            warn!(connection = %connection.key(), peer = %connection.peer(), handler = ?handler, error = %err, "Invalid data received, disconnecting");
        } else {
            error!(connection = %connection.key(), peer = %connection.peer(), handler = ?handler, error = %err, "Handler failed, disconnecting");
        }
        connection.disconnect();
    }
}

/// Server-side dispatcher: handlers plus the set of client connections
pub struct ServerDispatcher {
    dispatcher: Dispatcher,
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
}

impl ServerDispatcher {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_connection(&self, id: ConnectionId, connection: Arc<Connection>) -> Result<()> {
        let mut connections = self
            .connections
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        if connections.contains_key(&id) {
            return Err(ProtocolError::DuplicateConnection);
        }
        connections.insert(id, connection);
        Ok(())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .ok()
            .and_then(|connections| connections.get(&id).cloned())
    }

    /// Snapshot of all connections, ordered by id
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .ok()
            .and_then(|mut connections| connections.remove(&id))
    }

    /// Drop closed connections from the map and return them
    pub fn remove_inactive(&self) -> Vec<Arc<Connection>> {
        let Ok(mut connections) = self.connections.write() else {
            return Vec::new();
        };
        let closed: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, connection)| !connection.is_active())
            .map(|(id, _)| *id)
            .collect();
        closed
            .into_iter()
            .filter_map(|id| connections.remove(&id))
            .collect()
    }

    /// Queue `payload` for `handler` on every open connection. Returns how
    /// many connections accepted it.
    pub fn send_all(&self, handler: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for connection in self.connections() {
            match self.dispatcher.send(&connection, handler, payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(connection = %connection.key(), handler = %handler, error = %e, "Skipped connection in send_all")
                }
            }
        }
        delivered
    }

    pub fn send_message_all<M: NetworkMessage>(&self, message: &M) -> usize {
        self.send_all(M::NAME, message.as_bytes())
    }

    pub fn disconnect_all(&self) {
        for connection in self.connections() {
            connection.disconnect();
        }
    }
}

impl std::ops::Deref for ServerDispatcher {
    type Target = Dispatcher;

    fn deref(&self) -> &Self::Target {
        &self.dispatcher
    }
}

/// Client-side dispatcher: handlers plus the connection to the server
pub struct ClientDispatcher {
    dispatcher: Dispatcher,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl ClientDispatcher {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            connection: RwLock::new(None),
        }
    }

    /// Use `connection` as the server connection. A previous, different
    /// connection is disconnected.
    pub fn set_connection(&self, connection: Arc<Connection>) {
        let previous = match self.connection.write() {
            Ok(mut slot) => slot.replace(connection.clone()),
            Err(_) => return,
        };
        if let Some(previous) = previous {
            if previous.key() != connection.key() {
                previous.disconnect();
            }
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().ok().and_then(|slot| slot.clone())
    }

    pub fn clear_connection(&self) -> Option<Arc<Connection>> {
        self.connection.write().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_connected(&self) -> bool {
        self.connection()
            .map(|connection| connection.is_active())
            .unwrap_or(false)
    }

    /// Queue `payload` for `handler` on the server
    pub fn send_to_server(&self, handler: &str, payload: &[u8]) -> Result<()> {
        let connection = self.connection().ok_or(ProtocolError::NotConnected)?;
        self.dispatcher.send(&connection, handler, payload)
    }

    pub fn send_message_to_server<M: NetworkMessage>(&self, message: &M) -> Result<()> {
        self.send_to_server(M::NAME, message.as_bytes())
    }
}

impl std::ops::Deref for ClientDispatcher {
    type Target = Dispatcher;

    fn deref(&self) -> &Self::Target {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;
    use crate::transport::{Peer, Transport};
    use std::sync::Mutex;
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    struct Ping {
        sequence: u32,
    }

    impl NetworkMessage for Ping {
        const NAME: &'static str = "Ping";
    }

    fn connection() -> Connection {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        Connection::new(Peer::Server, transport, WriterPool::new(2))
    }

    fn frame(dispatcher: &Dispatcher, entries: &[(&str, &[u8])]) -> Bytes {
        let mut writer = NetworkWriter::new();
        for (handler, payload) in entries {
            dispatcher
                .write_sub_message(&mut writer, handler, payload)
                .unwrap();
        }
        writer.to_bytes()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let dispatcher = Dispatcher::default();
        dispatcher.register("Ping", |_, _| Ok(())).unwrap();
        assert!(matches!(
            dispatcher.register("Ping", |_, _| Ok(())),
            Err(ProtocolError::DuplicateHandler(_))
        ));
        assert!(dispatcher.remove("Ping"));
        assert!(!dispatcher.remove("Ping"));
        dispatcher.register("Ping", |_, _| Ok(())).unwrap();
    }

    #[test]
    fn test_hash_collision_rejected() {
        let dispatcher = Dispatcher::new(
            HandlerIdEncoding::StableHash,
            WriterPool::new(1),
            Arc::new(Diagnostics::new()),
        );
        // A leading U+00FF contributes 255 % 255 == 0 to both sums
        assert_eq!(stable_hash("a"), stable_hash("\u{ff}a"));
        dispatcher.register("a", |_, _| Ok(())).unwrap();
        assert!(matches!(
            dispatcher.register("\u{ff}a", |_, _| Ok(())),
            Err(ProtocolError::HandlerHashCollision { .. })
        ));
    }

    #[test]
    fn test_each_handler_gets_its_own_slice() {
        let dispatcher = Dispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["A", "B"] {
            let seen = seen.clone();
            dispatcher
                .register(name, move |_, payload| {
                    seen.lock().unwrap().push((name, payload.to_vec()));
                    Ok(())
                })
                .unwrap();
        }

        let data = frame(&dispatcher, &[("A", &b"one"[..]), ("B", &b""[..]), ("A", &b"three"[..])]);
        let sizes = dispatcher.sub_message_size("A", 3)
            + dispatcher.sub_message_size("B", 0)
            + dispatcher.sub_message_size("A", 5);
        assert_eq!(sizes, data.len());

        let connection = connection();
        assert!(dispatcher.process(&connection, data));

        assert!(connection.is_active());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("A", b"one".to_vec()),
                ("B", Vec::new()),
                ("A", b"three".to_vec())
            ]
        );
    }

    #[test]
    fn test_unknown_handler_disconnects() {
        let dispatcher = Dispatcher::default();
        let connection = connection();
        assert!(!dispatcher.process(&connection, frame(&dispatcher, &[("Missing", &b"x"[..])])));
        assert!(!connection.is_active());
        assert_eq!(dispatcher.diagnostics().snapshot().protocol_errors, 1);
    }

    #[test]
    fn test_rejection_stops_forced_drain() {
        let dispatcher = Dispatcher::default();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        dispatcher
            .register("Count", move |_, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();

        let mut stream = NetworkWriter::new();
        for data in [
            frame(&dispatcher, &[("Unknown", &b""[..])]),
            frame(&dispatcher, &[("Count", &b""[..])]),
        ] {
            stream.write(data.len() as u32);
            stream.write_bytes(&data);
        }

        let connection = connection();
        connection.enqueue_received(stream.as_slice()).unwrap();
        connection.forced_disconnect(|c, data| dispatcher.process(c, data));

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(dispatcher.diagnostics().snapshot().protocol_errors, 1);
        assert!(!connection.is_active());
    }

    #[test]
    fn test_truncated_sub_message_disconnects() {
        let dispatcher = Dispatcher::default();
        dispatcher.register("A", |_, _| Ok(())).unwrap();

        let full = frame(&dispatcher, &[("A", &b"payload"[..])]);
        let connection = connection();
        dispatcher.process(&connection, full.slice(..full.len() - 2));
        assert!(!connection.is_active());
    }

    #[test]
    fn test_failing_handler_stops_the_frame() {
        let dispatcher = Dispatcher::default();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        dispatcher
            .register("Fail", |_, _| Err(ProtocolError::Custom("boom".into())))
            .unwrap();
        dispatcher
            .register("Count", move |_, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();

        let connection = connection();
        dispatcher.process(
            &connection,
            frame(&dispatcher, &[("Count", &b""[..]), ("Fail", &b""[..]), ("Count", &b""[..])]),
        );
        assert!(!connection.is_active());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let dispatcher = Dispatcher::default();
        dispatcher
            .register("Panic", |_, _| panic!("handler bug"))
            .unwrap();

        let connection = connection();
        dispatcher.process(&connection, frame(&dispatcher, &[("Panic", &b""[..])]));
        assert!(!connection.is_active());
    }

    #[test]
    fn test_typed_message_checks_size() {
        let dispatcher = Dispatcher::default();
        let received = Arc::new(Mutex::new(None));
        let slot = received.clone();
        dispatcher
            .register_message::<Ping, _>(move |_, ping| {
                *slot.lock().unwrap() = Some(ping);
            })
            .unwrap();

        let good = connection();
        dispatcher.process(
            &good,
            frame(&dispatcher, &[("Ping", Ping { sequence: 9 }.as_bytes())]),
        );
        assert_eq!(*received.lock().unwrap(), Some(Ping { sequence: 9 }));

        let bad = connection();
        dispatcher.process(&bad, frame(&dispatcher, &[("Ping", &[1u8, 2][..])]));
        assert!(!bad.is_active());
    }

    #[test]
    fn test_stable_hash_ids() {
        let dispatcher = Dispatcher::new(
            HandlerIdEncoding::StableHash,
            WriterPool::new(1),
            Arc::new(Diagnostics::new()),
        );
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        dispatcher
            .register("SyncObject", move |_, payload| {
                assert_eq!(&payload[..], b"abc");
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();

        let data = frame(&dispatcher, &[("SyncObject", &b"abc"[..])]);
        // u16 id + i32 length + payload
        assert_eq!(data.len(), 2 + 4 + 3);
        assert_eq!(dispatcher.sub_message_size("SyncObject", 3), data.len());

        let connection = connection();
        dispatcher.process(&connection, data);
        assert!(connection.is_active());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_diagnostics_recorded() {
        let diagnostics = Arc::new(Diagnostics::new());
        diagnostics.set_recording(true);
        let dispatcher = Dispatcher::new(HandlerIdEncoding::Name, WriterPool::new(1), diagnostics.clone());
        dispatcher.register("A", |_, _| Ok(())).unwrap();

        let connection = connection();
        dispatcher.process(&connection, frame(&dispatcher, &[("A", &b"1234"[..]), ("A", &b"56"[..])]));

        let info = diagnostics.handled.get("A").unwrap();
        assert_eq!(info.count, 2);
        assert_eq!(info.total_size, 6);
    }

    #[test]
    fn test_server_dispatcher_connections() {
        let server = ServerDispatcher::new(Dispatcher::default());
        let first = Arc::new(connection());
        let second = Arc::new(connection());
        server.add_connection(ConnectionId(1), first.clone()).unwrap();
        server.add_connection(ConnectionId(2), second.clone()).unwrap();
        assert!(matches!(
            server.add_connection(ConnectionId(1), first.clone()),
            Err(ProtocolError::DuplicateConnection)
        ));

        assert_eq!(server.send_all("Any", &b"x"[..]), 2);

        second.disconnect();
        let removed = server.remove_inactive();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key(), second.key());
        assert_eq!(server.len(), 1);
        assert!(server.connection(ConnectionId(2)).is_none());
    }

    #[test]
    fn test_client_dispatcher_replaces_connection() {
        let client = ClientDispatcher::new(Dispatcher::default());
        assert!(matches!(
            client.send_to_server("Ping", &b""[..]),
            Err(ProtocolError::NotConnected)
        ));

        let first = Arc::new(connection());
        client.set_connection(first.clone());
        assert!(client.is_connected());

        let second = Arc::new(connection());
        client.set_connection(second.clone());
        assert!(!first.is_active());
        assert!(second.is_active());
        client.send_to_server("Ping", &b""[..]).unwrap();
    }
}
