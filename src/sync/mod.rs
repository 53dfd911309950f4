//! # Replication
//!
//! Owner-authoritative replicated state. Every replicated object belongs to an
//! owner (an [`OwnerId`]) and has a one-byte id within that owner, so an
//! owner holds at most 255 objects.
//!
//! ## Envelope
//! ```text
//! [owner: u32 LE] [sync id: u8] [operation tag: i16 LE] [operation payload]
//! ```
//! The envelope travels as the payload of a `"SyncObject"` sub-message, in the
//! same ordered stream as all other dispatcher traffic, so operations on one
//! object apply in the order they were written.
//!
//! ## Authority
//! - [`SyncMode::ServerOwner`]: only a server writes. Changes fan out to the
//!   observers in the owner's scope.
//! - [`SyncMode::ClientOwner`]: only an owner connection writes. The server
//!   applies the change and relays it to every other observer in scope.
//!
//! A client that writes a server-owned object, or a connection outside the
//! owner set that writes a client-owned one, is disconnected and the change
//! is never applied.

pub mod list;
pub mod object;
pub mod registry;
pub mod value;

use crate::core::reader::NetworkReader;
use crate::core::writer::NetworkWriter;
use crate::error::constants::ERR_TRAILING_BYTES;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;

pub use list::SyncList;
pub use object::SyncObject;
pub use registry::SyncRegistry;
pub use value::SyncValue;

/// Handler name used for every replication sub-message
pub const SYNC_HANDLER: &str = "SyncObject";

/// Maximum number of objects per owner
pub const MAX_SYNC_OBJECTS: usize = u8::MAX as usize;

/// Who may write a replicated object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    ServerOwner,
    ClientOwner,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::ServerOwner => "ServerOwner",
            SyncMode::ClientOwner => "ClientOwner",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire reference to the owner of a group of replicated objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u32);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Operation tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OperationTag {
    Init = 0,
    AddRange = 1,
    RemoveRange = 2,
    Replace = 101,
    RemoveAt = 102,
    Insert = 103,
    Move = 104,
}

impl OperationTag {
    pub fn read(reader: &mut NetworkReader) -> Result<Self> {
        Self::try_from(reader.read::<i16>()?)
    }

    pub fn write(self, writer: &mut NetworkWriter) {
        writer.write(self as i16);
    }
}

impl TryFrom<i16> for OperationTag {
    type Error = ProtocolError;

    fn try_from(tag: i16) -> Result<Self> {
        match tag {
            0 => Ok(OperationTag::Init),
            1 => Ok(OperationTag::AddRange),
            2 => Ok(OperationTag::RemoveRange),
            101 => Ok(OperationTag::Replace),
            102 => Ok(OperationTag::RemoveAt),
            103 => Ok(OperationTag::Insert),
            104 => Ok(OperationTag::Move),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

/// State behind a replicated object
///
/// `apply` receives the operation bytes of one envelope. It must decode the
/// whole operation, reject trailing bytes and out-of-range indices, and only
/// then mutate, so a rejected operation leaves the state untouched.
pub trait SyncState: Send + Sync {
    /// Write the full current state as an `Init` operation
    fn write_init(&self, writer: &mut NetworkWriter) -> Result<()>;

    /// Apply one received operation. `sender` is the connection it came from.
    fn apply(&self, operation: &mut NetworkReader, sender: Option<&Connection>) -> Result<()>;
}

/// Fail unless `reader` has been read to the end
pub fn expect_consumed(reader: &NetworkReader) -> Result<()> {
    if reader.remaining() != 0 {
        return Err(ProtocolError::InvalidData(format!(
            "{ERR_TRAILING_BYTES}: {} left",
            reader.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tags() {
        for tag in [
            OperationTag::Init,
            OperationTag::AddRange,
            OperationTag::RemoveRange,
            OperationTag::Replace,
            OperationTag::RemoveAt,
            OperationTag::Insert,
            OperationTag::Move,
        ] {
            assert_eq!(OperationTag::try_from(tag as i16).unwrap(), tag);
        }
        assert!(matches!(
            OperationTag::try_from(3),
            Err(ProtocolError::UnknownOperation(3))
        ));
    }

    #[test]
    fn test_tag_wire_format() {
        let mut writer = NetworkWriter::new();
        OperationTag::Move.write(&mut writer);
        assert_eq!(writer.as_slice(), &[104, 0]);
    }

    #[test]
    fn test_expect_consumed() {
        let mut reader = NetworkReader::from_slice(&[1, 2]);
        assert!(expect_consumed(&reader).is_err());
        reader.skip(2).unwrap();
        assert!(expect_consumed(&reader).is_ok());
    }
}
