//! # Replicated Value
//!
//! A single blittable value. Every write sends the whole value as an `Init`
//! operation, so there is no separate late-joiner path.
//!
//! An optional setter hook runs on every value before it is stored, both for
//! local writes and for received ones. It gets the connection the value came
//! from, or the link to the server for local writes on a client, and can
//! clamp or reject-by-replacement.
//!
//! ```rust
//! use blitnet::sync::{OwnerId, SyncMode, SyncRegistry, SyncValue};
//!
//! let registry = SyncRegistry::default();
//! registry.set_server(true);
//!
//! let health = SyncValue::with_setter(
//!     &registry,
//!     OwnerId(1),
//!     SyncMode::ServerOwner,
//!     100u32,
//!     |value, _| value.min(100),
//! )
//! .unwrap();
//! health.set(250).unwrap();
//! assert_eq!(health.get(), 100);
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use crate::core::codec::Blittable;
use crate::core::reader::NetworkReader;
use crate::core::writer::NetworkWriter;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use crate::sync::object::SyncObject;
use crate::sync::registry::SyncRegistry;
use crate::sync::{expect_consumed, OperationTag, OwnerId, SyncMode, SyncState};

type Setter<T> = Box<dyn Fn(T, Option<&Connection>) -> T + Send + Sync>;

struct ValueState<T> {
    value: Mutex<T>,
    setter: Option<Setter<T>>,
}

impl<T: Blittable> ValueState<T> {
    fn get(&self) -> T {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the setter and store the result
    fn store(&self, value: T, connection: Option<&Connection>) -> T {
        let value = match &self.setter {
            Some(setter) => setter(value, connection),
            None => value,
        };
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
        value
    }
}

impl<T: Blittable> SyncState for ValueState<T> {
    fn write_init(&self, writer: &mut NetworkWriter) -> Result<()> {
        OperationTag::Init.write(writer);
        writer.write_blittable(&self.get());
        Ok(())
    }

    fn apply(&self, operation: &mut NetworkReader, sender: Option<&Connection>) -> Result<()> {
        let tag = OperationTag::read(operation)?;
        if tag != OperationTag::Init {
            return Err(ProtocolError::UnknownOperation(tag as i16));
        }
        let value = operation.read_blittable::<T>()?;
        expect_consumed(operation)?;

        self.store(value, sender);
        Ok(())
    }
}

/// A replicated `T`
pub struct SyncValue<T: Blittable> {
    object: SyncObject,
    state: Arc<ValueState<T>>,
}

impl<T: Blittable> SyncValue<T> {
    pub fn new(registry: &SyncRegistry, owner: OwnerId, mode: SyncMode, initial: T) -> Result<Self> {
        Self::build(registry, owner, mode, initial, None)
    }

    /// Like [`SyncValue::new`], passing every value through `setter` before
    /// it is stored. The initial value is stored as given.
    pub fn with_setter<F>(
        registry: &SyncRegistry,
        owner: OwnerId,
        mode: SyncMode,
        initial: T,
        setter: F,
    ) -> Result<Self>
    where
        F: Fn(T, Option<&Connection>) -> T + Send + Sync + 'static,
    {
        Self::build(registry, owner, mode, initial, Some(Box::new(setter)))
    }

    fn build(
        registry: &SyncRegistry,
        owner: OwnerId,
        mode: SyncMode,
        initial: T,
        setter: Option<Setter<T>>,
    ) -> Result<Self> {
        let state = Arc::new(ValueState {
            value: Mutex::new(initial),
            setter,
        });
        let object = registry.register(owner, mode, state.clone())?;
        Ok(Self { object, state })
    }

    pub fn object(&self) -> &SyncObject {
        &self.object
    }

    pub fn get(&self) -> T {
        self.state.get()
    }

    /// Store `value` (after the setter) and send it
    ///
    /// Nothing is stored if this process may not write the value or the
    /// value cannot fit in one frame on a peer.
    pub fn set(&self, value: T) -> Result<()> {
        self.object.check_write()?;

        let mut writer = self.object.registry().pool().acquire();
        OperationTag::Init.write(&mut writer);
        writer.write_blittable(&value);
        self.object.check_publish(writer.position())?;

        let link = self.object.registry().server_link();
        let stored = self.state.store(value, link.as_deref());

        writer.clear();
        OperationTag::Init.write(&mut writer);
        writer.write_blittable(&stored);
        self.object.publish(writer.as_slice())?;
        Ok(())
    }
}

impl<T: Blittable + std::fmt::Debug> std::fmt::Debug for SyncValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncValue")
            .field("object", &self.object)
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: OwnerId = OwnerId(3);

    fn operation(tag: OperationTag, value: &[u8]) -> NetworkReader {
        let mut writer = NetworkWriter::new();
        tag.write(&mut writer);
        writer.write_bytes(value);
        NetworkReader::new(writer.to_bytes())
    }

    #[test]
    fn test_set_requires_authority() {
        let registry = SyncRegistry::default();
        let value = SyncValue::new(&registry, OWNER, SyncMode::ClientOwner, 5i32).unwrap();
        assert!(matches!(value.set(6), Err(ProtocolError::Unauthorized(_))));
        assert_eq!(value.get(), 5);

        registry.set_client(true);
        value.set(6).unwrap();
        assert_eq!(value.get(), 6);
    }

    #[test]
    fn test_received_value_goes_through_setter() {
        let registry = SyncRegistry::default();
        let value = SyncValue::with_setter(&registry, OWNER, SyncMode::ServerOwner, 0u16, |v, _| {
            v.min(10)
        })
        .unwrap();

        value
            .state
            .apply(&mut operation(OperationTag::Init, &500u16.to_le_bytes()), None)
            .unwrap();
        assert_eq!(value.get(), 10);
    }

    #[test]
    fn test_malformed_operations_rejected() {
        let registry = SyncRegistry::default();
        let value = SyncValue::new(&registry, OWNER, SyncMode::ServerOwner, 1u32).unwrap();

        let wrong_tag = value
            .state
            .apply(&mut operation(OperationTag::Move, &2u32.to_le_bytes()), None);
        assert!(matches!(wrong_tag, Err(ProtocolError::UnknownOperation(104))));

        let short = value
            .state
            .apply(&mut operation(OperationTag::Init, &[2, 0]), None);
        assert!(matches!(short, Err(ProtocolError::EndOfData { .. })));

        let long = value
            .state
            .apply(&mut operation(OperationTag::Init, &[2, 0, 0, 0, 9]), None);
        assert!(long.is_err());

        assert_eq!(value.get(), 1);
    }

    #[test]
    fn test_init_carries_current_value() {
        let registry = SyncRegistry::default();
        let value = SyncValue::new(&registry, OWNER, SyncMode::ServerOwner, 0x0102_0304u32).unwrap();
        let mut writer = NetworkWriter::new();
        value.state.write_init(&mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[0, 0, 4, 3, 2, 1]);
    }
}
