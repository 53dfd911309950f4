//! # Writer Pool
//!
//! Thread-safe pool of reusable [`NetworkWriter`]s. Batches and outgoing
//! sub-messages are built in pooled writers so steady-state traffic does not
//! allocate.
//!
//! A [`PooledWriter`] returns itself to the pool when dropped, cleared but with
//! its capacity kept. A writer can only be returned once, and a writer from
//! one pool can never end up in another pool's free list twice, because the
//! return happens exactly once in `Drop`. Writers that grew past the
//! configured maximum capacity are deallocated instead of pooled.
//!
//! ## Usage
//! ```rust
//! use blitnet::utils::buffer_pool::WriterPool;
//!
//! let pool = WriterPool::new(4);
//! {
//!     let mut writer = pool.acquire();
//!     writer.write(7u32);
//!     assert_eq!(writer.position(), 4);
//! } // returned to the pool here
//! assert_eq!(pool.available(), 4);
//! assert_eq!(pool.acquire().position(), 0);
//! ```

use std::sync::{Arc, Mutex};

use crate::core::writer::{NetworkWriter, DEFAULT_WRITER_CAPACITY};

/// Writers larger than this are not returned to the pool
pub const DEFAULT_MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// A pooled writer that returns itself to the pool when dropped
pub struct PooledWriter {
    writer: NetworkWriter,
    pool: Arc<Mutex<Vec<NetworkWriter>>>,
    max_pooled_capacity: usize,
}

impl PooledWriter {
    /// Detach the writer from the pool. It will not be returned.
    pub fn into_inner(mut self) -> NetworkWriter {
        std::mem::replace(&mut self.writer, NetworkWriter::with_capacity(0))
    }
}

impl Drop for PooledWriter {
    fn drop(&mut self) {
        let capacity = self.writer.capacity();
        if capacity == 0 || capacity > self.max_pooled_capacity {
            return;
        }

        self.writer.clear();
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(std::mem::replace(
                &mut self.writer,
                NetworkWriter::with_capacity(0),
            ));
        }
    }
}

impl std::ops::Deref for PooledWriter {
    type Target = NetworkWriter;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl std::ops::DerefMut for PooledWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

impl std::fmt::Debug for PooledWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWriter")
            .field("position", &self.writer.position())
            .field("capacity", &self.writer.capacity())
            .finish()
    }
}

/// Thread-safe pool of [`NetworkWriter`]s
#[derive(Clone)]
pub struct WriterPool {
    pool: Arc<Mutex<Vec<NetworkWriter>>>,
    writer_capacity: usize,
    max_pooled_capacity: usize,
}

impl WriterPool {
    /// Create a pool with `preallocated` writers ready to use
    pub fn new(preallocated: usize) -> Self {
        Self::with_limits(
            preallocated,
            DEFAULT_WRITER_CAPACITY,
            DEFAULT_MAX_POOLED_CAPACITY,
        )
    }

    pub fn with_limits(
        preallocated: usize,
        writer_capacity: usize,
        max_pooled_capacity: usize,
    ) -> Self {
        let writer_capacity = writer_capacity.max(1);
        let pool = (0..preallocated)
            .map(|_| NetworkWriter::with_capacity(writer_capacity))
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            writer_capacity,
            max_pooled_capacity: max_pooled_capacity.max(writer_capacity),
        }
    }

    /// Take a cleared writer from the pool, or allocate one if the pool is empty
    pub fn acquire(&self) -> PooledWriter {
        let writer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| NetworkWriter::with_capacity(self.writer_capacity));

        PooledWriter {
            writer,
            pool: self.pool.clone(),
            max_pooled_capacity: self.max_pooled_capacity,
        }
    }

    /// Number of idle writers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::new(16)
    }
}

impl std::fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterPool")
            .field("available", &self.available())
            .field("writer_capacity", &self.writer_capacity)
            .finish()
    }
}
