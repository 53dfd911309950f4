//! Typed application messages.
//!
//! A message is a blittable value with a routing name. Its payload on the
//! wire is exactly its bytes, so a handler rejects any sub-message whose
//! length differs from the message size.
//!
//! ```rust
//! use blitnet::protocol::message::NetworkMessage;
//! use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
//!
//! #[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
//! #[repr(C)]
//! struct Ping {
//!     sent_at_ms: u64,
//! }
//!
//! impl NetworkMessage for Ping {
//!     const NAME: &'static str = "Ping";
//! }
//! ```

use crate::core::codec::Blittable;

/// A blittable value routed to the handler registered under [`Self::NAME`]
pub trait NetworkMessage: Blittable {
    const NAME: &'static str;
}
