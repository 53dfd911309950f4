//! # blitnet
//!
//! Batched client/server messaging and owner-authoritative state replication
//! for real-time multiplayer applications.
//!
//! ## Layers
//! - [`core`]: little-endian codec for blittable values, batcher and unbatcher
//! - [`transport`]: transport contract, thread-safe event queue, loopback and TCP transports
//! - [`protocol`]: connections, sub-message dispatch, typed messages
//! - [`sync`]: replicated objects with single-writer authority
//! - [`app`]: application context and tick driver
//! - [`config`], [`error`], [`utils`]: configuration, errors, pooling, diagnostics and logging
//!
//! ## Wire Format
//! ```text
//! batch       = frame*
//! frame       = [len: u32 LE] [sub-message*]
//! sub-message = [handler id] [len: i32 LE] [payload]
//! ```
//!
//! ## Threading
//! Transports do their I/O on background tasks and only push events into a
//! queue. All connection, dispatch and replication state is touched from the
//! thread that calls [`app::NetworkApplication::tick`].

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod utils;

pub use app::{NetworkApplication, NetworkBehaviour, NetworkContext};
pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::connection::Connection;
pub use protocol::dispatcher::{ClientDispatcher, Dispatcher, HandlerIdEncoding, ServerDispatcher};
pub use protocol::message::NetworkMessage;
pub use sync::{OwnerId, SyncList, SyncMode, SyncRegistry, SyncValue};
