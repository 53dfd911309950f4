//! # Error Types
//!
//! Error handling for the codec, framing, dispatch and replication layers.
//!
//! ## Error Categories
//! - **Data errors**: truncated reads, bad length prefixes, invalid UTF-8
//! - **Protocol violations**: unknown handlers, unauthorized sync writes,
//!   oversized frames. These end with a disconnect of the offending connection.
//! - **Usage errors**: duplicate handler registration, writes without authority,
//!   exceeding the per-owner sync object capacity
//! - **Transport errors**: socket and connect failures reported by a transport
//!
//! ## Example Usage
//! ```rust
//! use blitnet::core::reader::NetworkReader;
//! use blitnet::error::{ProtocolError, Result};
//!
//! fn read_header(reader: &mut NetworkReader) -> Result<u32> {
//!     reader.read::<u32>()
//! }
//!
//! let mut reader = NetworkReader::from_slice(&[1, 2]);
//! assert!(matches!(read_header(&mut reader), Err(ProtocolError::EndOfData { .. })));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants shared by log lines and error payloads.
pub mod constants {
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire sync registry lock";
    pub const ERR_NULL_HANDLER_ID: &str = "Handler id is absent";
    pub const ERR_NULL_ELEMENT_LIST: &str = "Element list is absent";
    pub const ERR_TRAILING_BYTES: &str = "Sub-message has unread trailing bytes";
    pub const ERR_CLIENT_WRITE_SERVER_OWNED: &str = "Client attempted to write a server-owned sync object";
    pub const ERR_NOT_OWNER_CONNECTION: &str = "Connection is not an owner of the sync object";
    pub const ERR_WRITE_REQUIRES_SERVER: &str = "Server-owned sync objects can only be written by a server";
    pub const ERR_WRITE_REQUIRES_CLIENT: &str = "Client-owned sync objects can only be written by a client";
    pub const ERR_SERVER_NOT_STARTED: &str = "Server role is not started";
    pub const ERR_CLIENT_NOT_STARTED: &str = "Client role is not started";
}

/// ProtocolError is the primary error type for all operations in this crate
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("End of data: needed {needed} bytes, {remaining} remaining")]
    EndOfData { needed: usize, remaining: usize },

    #[error("Invalid length prefix: {0}")]
    InvalidLength(i32),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload of {size} bytes exceeds batch threshold of {threshold} bytes")]
    OversizedPayload { size: usize, threshold: usize },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    OversizedFrame { size: usize, limit: usize },

    #[error("Connection is not active")]
    ConnectionInactive,

    #[error("No connection to the server")]
    NotConnected,

    #[error("Connection has already been added")]
    DuplicateConnection,

    #[error("A handler with name {0} is already registered")]
    DuplicateHandler(String),

    #[error("Handler {name} has the same stable hash ({hash:#06x}) as {existing}")]
    HandlerHashCollision {
        name: String,
        existing: String,
        hash: u16,
    },

    #[error("No handler registered for {0}")]
    UnknownHandler(String),

    #[error("Handler {0} panicked")]
    HandlerPanicked(String),

    #[error("Unknown sync object {id} of owner {owner}")]
    UnknownSyncObject { owner: u32, id: u8 },

    #[error("Unknown sync operation tag {0}")]
    UnknownOperation(i16),

    #[error("{member} must be used with sync mode {expected}")]
    WrongSyncMode {
        member: &'static str,
        expected: &'static str,
    },

    #[error("Unauthorized sync write: {0}")]
    Unauthorized(String),

    #[error("Owner {0} already has the maximum number of sync objects")]
    SyncCapacityExceeded(u32),

    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for errors caused by bytes a peer sent. These end the connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::EndOfData { .. }
                | ProtocolError::InvalidLength(_)
                | ProtocolError::InvalidUtf8(_)
                | ProtocolError::OversizedFrame { .. }
                | ProtocolError::UnknownHandler(_)
                | ProtocolError::UnknownSyncObject { .. }
                | ProtocolError::UnknownOperation(_)
                | ProtocolError::Unauthorized(_)
                | ProtocolError::IndexOutOfRange { .. }
                | ProtocolError::InvalidData(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
