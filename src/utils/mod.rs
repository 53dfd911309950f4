//! # Utility Modules
//!
//! Supporting utilities for buffer reuse, diagnostics and logging.
//!
//! ## Components
//! - **Buffer Pool**: reusable network writers returned on drop
//! - **Metrics**: per-handler byte accounting and connection counters
//! - **Logging**: `tracing` subscriber setup from configuration

pub mod buffer_pool;
pub mod logging;
pub mod metrics;

pub use buffer_pool::{PooledWriter, WriterPool};
pub use metrics::{Diagnostics, DiagnosticsSnapshot};
