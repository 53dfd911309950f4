//! Handle to one registered replicated object.

use crate::error::Result;
use crate::protocol::connection::Connection;
use crate::sync::registry::SyncRegistry;
use crate::sync::{OwnerId, SyncMode};

/// Identity and authority of a registered object
///
/// Created by [`SyncRegistry::register`]. Dropping the handle disposes the
/// object: its id is freed and later operations addressed to it are rejected
/// as unknown.
pub struct SyncObject {
    registry: SyncRegistry,
    owner: OwnerId,
    id: u8,
    mode: SyncMode,
}

impl SyncObject {
    pub(crate) fn new(registry: SyncRegistry, owner: OwnerId, id: u8, mode: SyncMode) -> Self {
        Self {
            registry,
            owner,
            id,
            mode,
        }
    }

    #[inline]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Send the full current state to `connection`
    pub fn send_init_data(&self, connection: &Connection) -> Result<()> {
        self.registry.send_init_data(self.owner, self.id, connection)
    }

    /// Allow `connection` to write this client-owned object
    pub fn add_owner_connection(&self, connection: &Connection) -> Result<()> {
        self.registry
            .add_owner_connection(self.owner, self.id, connection)
    }

    pub fn remove_owner_connection(&self, connection: &Connection) -> Result<bool> {
        self.registry
            .remove_owner_connection(self.owner, self.id, connection)
    }

    pub fn is_owner_connection(&self, connection: &Connection) -> Result<bool> {
        self.registry
            .is_owner_connection(self.owner, self.id, connection)
    }

    /// Fail unless this process may write the object. Call before mutating.
    pub fn check_write(&self) -> Result<()> {
        self.registry.check_write(self.mode)
    }

    /// Fail unless this process may write the object and an operation of
    /// `operation_len` bytes fits in a frame on every peer it would go to.
    /// Call before mutating.
    pub fn check_publish(&self, operation_len: usize) -> Result<()> {
        self.registry
            .check_publish(self.owner, self.mode, operation_len)
    }

    /// Send an encoded operation to the peers that should see it
    pub fn publish(&self, operation: &[u8]) -> Result<usize> {
        self.registry
            .publish(self.owner, self.id, self.mode, operation)
    }
}

impl Drop for SyncObject {
    fn drop(&mut self) {
        self.registry.unregister(self.owner, self.id);
    }
}

impl std::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncObject")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}
