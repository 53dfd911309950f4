//! # Core Components
//!
//! Binary codec, batching and unbatching.
//!
//! This module is the foundation every other layer is built on: values are
//! encoded with [`writer::NetworkWriter`] and decoded with
//! [`reader::NetworkReader`], payloads are packed into size-bounded batches
//! by [`batcher::Batcher`] and cut back out of the received stream by
//! [`unbatcher::Unbatcher`].
//!
//! ## Wire Format
//! ```text
//! Frame:       [len: u32 LE] [payload(len)]
//! Batch:       Frame Frame ...                 (total <= threshold)
//! Primitives:  little-endian fixed width
//! Strings:     [len: i32 LE, -1 = absent] [utf-8 bytes]
//! ```
//!
//! ## Security
//! - Every read is bounds-checked
//! - Element counts are validated against remaining bytes before allocation
//! - Frame lengths are checked against the transport limit before buffering

pub mod batcher;
pub mod codec;
pub mod reader;
pub mod stable_hash;
pub mod unbatcher;
pub mod writer;
