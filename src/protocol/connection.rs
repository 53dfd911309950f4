//! # Connection
//!
//! One peer association: an outgoing [`Batcher`], an incoming [`Unbatcher`]
//! and a lifecycle.
//!
//! ## Lifecycle
//! ```text
//! Open --disconnect()---------> Closing (flush outgoing)   --> Closed (SelfInitiated)
//! Open --forced_disconnect()--> Closing (drain incoming)   --> Closed (Forced)
//! ```
//! Only one of the two paths ever runs for a connection; the transition out
//! of `Open` is a single compare-exchange. Both paths clear the batcher and
//! the unbatcher and then notify the disconnect observers exactly once.
//!
//! Sending and enqueueing received data require `Open`. A connection stays
//! active (`is_active()`) through `Closing`, so data drained by a forced
//! disconnect can still be dispatched.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::core::batcher::{Batcher, FRAME_HEADER_SIZE};
use crate::core::unbatcher::Unbatcher;
use crate::error::{ProtocolError, Result};
use crate::transport::{DisconnectKind, Peer, Transport};
use crate::utils::buffer_pool::WriterPool;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(u64);

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type DisconnectObserver = Box<dyn Fn(&Connection, DisconnectKind) + Send + Sync>;

struct Buffers {
    batcher: Batcher,
    unbatcher: Unbatcher,
}

pub struct Connection {
    key: ConnectionKey,
    peer: Peer,
    transport: Arc<dyn Transport>,
    frame_limit: usize,
    state: AtomicU8,
    buffers: Mutex<Buffers>,
    observers: Mutex<Vec<DisconnectObserver>>,
    disconnect_kind: Mutex<Option<DisconnectKind>>,
}

impl Connection {
    /// Create an open connection to `peer`. Batches are capped at the
    /// transport's frame size limit.
    pub fn new(peer: Peer, transport: Arc<dyn Transport>, pool: WriterPool) -> Self {
        let limit = transport.frame_size_limit() as usize;
        Self {
            key: ConnectionKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed)),
            peer,
            transport,
            frame_limit: limit,
            state: AtomicU8::new(OPEN),
            buffers: Mutex::new(Buffers {
                batcher: Batcher::new(limit, pool),
                unbatcher: Unbatcher::new(limit),
            }),
            observers: Mutex::new(Vec::new()),
            disconnect_kind: Mutex::new(None),
        }
    }

    #[inline]
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    #[inline]
    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Largest payload [`Connection::send`] accepts
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.frame_limit.saturating_sub(FRAME_HEADER_SIZE)
    }

    /// False once either disconnect path has completed
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED
    }

    /// How the connection ended, if it has
    pub fn disconnect_kind(&self) -> Option<DisconnectKind> {
        self.disconnect_kind.lock().ok().and_then(|kind| *kind)
    }

    fn buffers(&self) -> Result<MutexGuard<'_, Buffers>> {
        self.buffers
            .lock()
            .map_err(|_| ProtocolError::Custom("Connection buffers lock poisoned".to_string()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(ProtocolError::ConnectionInactive);
        }
        Ok(())
    }

    /// Queue `payload` for the next flush
    ///
    /// # Errors
    /// [`ProtocolError::ConnectionInactive`] after a disconnect started, or
    /// [`ProtocolError::OversizedPayload`] if the payload can never fit in a batch.
    /// The connection stays open in both cases.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.buffers()?.batcher.enqueue(payload)
    }

    /// Hand every pending batch to the transport. Returns the number of batches sent.
    pub fn flush(&self) -> Result<usize> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return Ok(0);
        }
        self.flush_batches()
    }

    fn flush_batches(&self) -> Result<usize> {
        let mut buffers = self.buffers()?;
        let mut sent = 0;
        while let Some(batch) = buffers.batcher.try_dequeue() {
            self.transport.send(self.peer, batch.to_bytes())?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Feed bytes received from the transport
    pub fn enqueue_received(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.buffers()?.unbatcher.enqueue(data);
        Ok(())
    }

    /// Pass every complete received frame to `handle`, in order
    ///
    /// The buffers are not locked while `handle` runs, so it may send on or
    /// disconnect this connection. Processing stops once the connection closes
    /// or `handle` returns false. A malformed stream disconnects the
    /// connection and returns the error.
    pub fn handle_received<F>(&self, mut handle: F) -> Result<()>
    where
        F: FnMut(&Connection, Bytes) -> bool,
    {
        loop {
            if !self.is_active() {
                return Ok(());
            }

            let next = self.buffers()?.unbatcher.try_dequeue();
            match next {
                Ok(Some(frame)) => {
                    if !handle(self, frame) {
                        debug!(connection = %self.key, "Stopped handling received data");
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!(connection = %self.key, peer = %self.peer, error = %e, "Unable to dequeue received data");
                    self.disconnect();
                    return Err(e);
                }
            }
        }
    }

    /// Flush pending batches, close, and tear the transport link down.
    /// Does nothing if a disconnect already started.
    pub fn disconnect(&self) {
        if !self.begin_close() {
            return;
        }

        if let Err(e) = self.flush_batches() {
            warn!(connection = %self.key, error = %e, "Failed to flush before disconnect");
        }
        self.finish(DisconnectKind::SelfInitiated);
        self.transport.disconnect(self.peer);
    }

    /// Handle a disconnect initiated by the peer or the transport: dispatch
    /// everything already received through `handle` until it returns false,
    /// then close. Does nothing if a disconnect already started.
    pub fn forced_disconnect<F>(&self, handle: F)
    where
        F: FnMut(&Connection, Bytes) -> bool,
    {
        if !self.begin_close() {
            return;
        }

        if let Err(e) = self.handle_received(handle) {
            debug!(connection = %self.key, error = %e, "Dropped malformed data on forced disconnect");
        }
        self.finish(DisconnectKind::Forced);
    }

    /// Register a callback for the end of this connection. Runs immediately
    /// if the connection is already closed.
    pub fn on_disconnect<F>(&self, observer: F)
    where
        F: Fn(&Connection, DisconnectKind) + Send + Sync + 'static,
    {
        if let Some(kind) = self.disconnect_kind() {
            observer(self, kind);
            return;
        }
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(Box::new(observer));
        }
    }

    fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self, kind: DisconnectKind) {
        if let Ok(mut buffers) = self.buffers() {
            buffers.batcher.clear();
            buffers.unbatcher.clear();
        }

        if let Ok(mut slot) = self.disconnect_kind.lock() {
            *slot = Some(kind);
        }
        self.state.store(CLOSED, Ordering::Release);
        debug!(connection = %self.key, peer = %self.peer, kind = ?kind, "Connection closed");

        let observers = self
            .observers
            .lock()
            .map(|mut observers| std::mem::take(&mut *observers))
            .unwrap_or_default();
        for observer in observers {
            observer(self, kind);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}
