//! # Protocol Layer
//!
//! Connections and message dispatch on top of the framing in [`crate::core`].
//!
//! ## Components
//! - **Connection**: one peer link with an outgoing batcher, an incoming
//!   unbatcher and a two-path disconnect lifecycle
//! - **Dispatcher**: handler registry and sub-message demultiplexing, with
//!   server and client variants
//! - **Message**: blittable typed messages routed by name

pub mod connection;
pub mod dispatcher;
pub mod message;
