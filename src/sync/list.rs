//! # Replicated List
//!
//! An ordered list of blittable elements. Every mutation is sent as one delta
//! operation; a late joiner gets the whole list as a single `Init`.
//!
//! ## Operations
//! ```text
//! Init        (0)    [count: i32] [elements]
//! AddRange    (1)    [count: i32] [elements]
//! RemoveRange (2)    [count: i32] [elements]
//! Replace     (101)  [index: i32] [element]
//! RemoveAt    (102)  [index: i32]
//! Insert      (103)  [index: i32] [element]
//! Move        (104)  [from: i32] [to: i32]
//! ```
//!
//! `RemoveRange` removes the first occurrence of each listed element and
//! skips elements that are not present. The owner always sends the full
//! requested range, so every receiver makes the same best-effort removal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::codec::Blittable;
use crate::core::reader::NetworkReader;
use crate::core::writer::NetworkWriter;
use crate::error::constants::ERR_NULL_ELEMENT_LIST;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use crate::sync::object::SyncObject;
use crate::sync::registry::SyncRegistry;
use crate::sync::{expect_consumed, OperationTag, OwnerId, SyncMode, SyncState};

#[derive(Debug, Clone, PartialEq)]
enum ListOp<T> {
    Init(Vec<T>),
    AddRange(Vec<T>),
    RemoveRange(Vec<T>),
    Replace(i32, T),
    RemoveAt(i32),
    Insert(i32, T),
    Move(i32, i32),
}

impl<T: Blittable + PartialEq> ListOp<T> {
    fn encode(&self, writer: &mut NetworkWriter) -> Result<()> {
        match self {
            ListOp::Init(items) => {
                OperationTag::Init.write(writer);
                writer.write_blittable_slice(Some(items.as_slice()))?;
            }
            ListOp::AddRange(items) => {
                OperationTag::AddRange.write(writer);
                writer.write_blittable_slice(Some(items.as_slice()))?;
            }
            ListOp::RemoveRange(items) => {
                OperationTag::RemoveRange.write(writer);
                writer.write_blittable_slice(Some(items.as_slice()))?;
            }
            ListOp::Replace(index, item) => {
                OperationTag::Replace.write(writer);
                writer.write(*index);
                writer.write_blittable(item);
            }
            ListOp::RemoveAt(index) => {
                OperationTag::RemoveAt.write(writer);
                writer.write(*index);
            }
            ListOp::Insert(index, item) => {
                OperationTag::Insert.write(writer);
                writer.write(*index);
                writer.write_blittable(item);
            }
            ListOp::Move(from, to) => {
                OperationTag::Move.write(writer);
                writer.write(*from);
                writer.write(*to);
            }
        }
        Ok(())
    }

    /// Decode one complete operation. Trailing bytes are an error.
    fn decode(reader: &mut NetworkReader) -> Result<Self> {
        let op = match OperationTag::read(reader)? {
            OperationTag::Init => ListOp::Init(read_items(reader)?),
            OperationTag::AddRange => ListOp::AddRange(read_items(reader)?),
            OperationTag::RemoveRange => ListOp::RemoveRange(read_items(reader)?),
            OperationTag::Replace => ListOp::Replace(reader.read()?, reader.read_blittable()?),
            OperationTag::RemoveAt => ListOp::RemoveAt(reader.read()?),
            OperationTag::Insert => ListOp::Insert(reader.read()?, reader.read_blittable()?),
            OperationTag::Move => ListOp::Move(reader.read()?, reader.read()?),
        };
        expect_consumed(reader)?;
        Ok(op)
    }

    /// Apply to `items`. Indices are checked before anything changes.
    /// Returns false if a `RemoveRange` skipped an element.
    fn apply_to(self, items: &mut Vec<T>) -> Result<bool> {
        match self {
            ListOp::Init(values) => *items = values,
            ListOp::AddRange(values) => items.extend(values),
            ListOp::RemoveRange(values) => {
                let mut all_removed = true;
                for value in &values {
                    match items.iter().position(|item| item == value) {
                        Some(position) => {
                            items.remove(position);
                        }
                        None => all_removed = false,
                    }
                }
                return Ok(all_removed);
            }
            ListOp::Replace(index, item) => {
                let index = checked_index(index, items.len(), items.len())?;
                items[index] = item;
            }
            ListOp::RemoveAt(index) => {
                let index = checked_index(index, items.len(), items.len())?;
                items.remove(index);
            }
            ListOp::Insert(index, item) => {
                let index = checked_index(index, items.len() + 1, items.len())?;
                items.insert(index, item);
            }
            ListOp::Move(from, to) => {
                let from = checked_index(from, items.len(), items.len())?;
                let to = checked_index(to, items.len(), items.len())?;
                let item = items.remove(from);
                items.insert(to, item);
            }
        }
        Ok(true)
    }
}

fn read_items<T: Blittable>(reader: &mut NetworkReader) -> Result<Vec<T>> {
    reader
        .read_blittable_vec()?
        .ok_or_else(|| ProtocolError::InvalidData(ERR_NULL_ELEMENT_LIST.to_string()))
}

/// `index` as a position below `bound`
fn checked_index(index: i32, bound: usize, len: usize) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|index| *index < bound)
        .ok_or(ProtocolError::IndexOutOfRange {
            index: i64::from(index),
            len,
        })
}

fn wire_index(index: usize, len: usize) -> Result<i32> {
    i32::try_from(index).map_err(|_| ProtocolError::IndexOutOfRange {
        index: index as i64,
        len,
    })
}

struct ListState<T> {
    items: Mutex<Vec<T>>,
}

impl<T> ListState<T> {
    fn items(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Blittable + PartialEq> SyncState for ListState<T> {
    fn write_init(&self, writer: &mut NetworkWriter) -> Result<()> {
        let items = self.items();
        OperationTag::Init.write(writer);
        writer.write_blittable_slice(Some(items.as_slice()))
    }

    fn apply(&self, operation: &mut NetworkReader, _sender: Option<&Connection>) -> Result<()> {
        let op = ListOp::decode(operation)?;
        op.apply_to(&mut self.items())?;
        Ok(())
    }
}

/// A replicated `Vec<T>`
///
/// Mutators check write authority first, apply the change locally, then
/// send it. Without authority they return [`ProtocolError::Unauthorized`]
/// and leave the list unchanged. An operation too large for one frame on
/// any peer fails with [`ProtocolError::OversizedPayload`], also unchanged.
pub struct SyncList<T: Blittable + PartialEq> {
    object: SyncObject,
    state: Arc<ListState<T>>,
}

impl<T: Blittable + PartialEq> SyncList<T> {
    pub fn new(registry: &SyncRegistry, owner: OwnerId, mode: SyncMode) -> Result<Self> {
        Self::with_capacity(registry, owner, mode, 0)
    }

    pub fn with_capacity(
        registry: &SyncRegistry,
        owner: OwnerId,
        mode: SyncMode,
        capacity: usize,
    ) -> Result<Self> {
        let state = Arc::new(ListState {
            items: Mutex::new(Vec::with_capacity(capacity)),
        });
        let object = registry.register(owner, mode, state.clone())?;
        Ok(Self { object, state })
    }

    pub fn object(&self) -> &SyncObject {
        &self.object
    }

    fn commit(&self, op: ListOp<T>) -> Result<bool> {
        self.object.check_write()?;

        let mut writer = self.object.registry().pool().acquire();
        op.encode(&mut writer)?;
        self.object.check_publish(writer.position())?;

        let applied = op.apply_to(&mut self.state.items())?;
        self.object.publish(writer.as_slice())?;
        Ok(applied)
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.commit(ListOp::AddRange(vec![item])).map(|_| ())
    }

    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) -> Result<()> {
        self.commit(ListOp::AddRange(items.into_iter().collect()))
            .map(|_| ())
    }

    /// Remove the first occurrence of `item`. Nothing is sent if it is absent.
    pub fn remove(&self, item: &T) -> Result<bool> {
        self.object.check_write()?;
        if !self.contains(item) {
            return Ok(false);
        }
        self.commit(ListOp::RemoveRange(vec![*item]))
    }

    /// Remove the first occurrence of each element. Returns true if every
    /// element was found. The whole range is sent either way.
    pub fn remove_range(&self, items: &[T]) -> Result<bool> {
        self.commit(ListOp::RemoveRange(items.to_vec()))
    }

    /// Empty the list. Sent as an empty `Init`.
    pub fn clear(&self) -> Result<()> {
        self.commit(ListOp::Init(Vec::new())).map(|_| ())
    }

    /// Replace the element at `index`
    pub fn set(&self, index: usize, item: T) -> Result<()> {
        let index = wire_index(index, self.len())?;
        self.commit(ListOp::Replace(index, item)).map(|_| ())
    }

    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        let index = wire_index(index, self.len())?;
        self.commit(ListOp::Insert(index, item)).map(|_| ())
    }

    pub fn remove_at(&self, index: usize) -> Result<()> {
        let index = wire_index(index, self.len())?;
        self.commit(ListOp::RemoveAt(index)).map(|_| ())
    }

    /// Move the element at `from` so it ends up at `to`
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let len = self.len();
        let op = ListOp::Move(wire_index(from, len)?, wire_index(to, len)?);
        self.commit(op).map(|_| ())
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.state.items().get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.state.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items().is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.state.items().contains(item)
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.state.items().iter().position(|candidate| candidate == item)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.state.items().clone()
    }
}

impl<T: Blittable + PartialEq + std::fmt::Debug> std::fmt::Debug for SyncList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncList")
            .field("object", &self.object)
            .field("items", &self.to_vec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: OwnerId = OwnerId(7);

    fn server_registry() -> SyncRegistry {
        let registry = SyncRegistry::default();
        registry.set_server(true);
        registry
    }

    fn encoded(op: &ListOp<u32>) -> NetworkReader {
        let mut writer = NetworkWriter::new();
        op.encode(&mut writer).unwrap();
        NetworkReader::new(writer.to_bytes())
    }

    #[test]
    fn test_move_wire_format() {
        let reader = encoded(&ListOp::Move(1, 2));
        assert_eq!(&reader.remaining_bytes()[..], &[104, 0, 1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_add_range_wire_format() {
        let reader = encoded(&ListOp::AddRange(vec![5, 6]));
        assert_eq!(
            &reader.remaining_bytes()[..],
            &[1, 0, 2, 0, 0, 0, 5, 0, 0, 0, 6, 0, 0, 0]
        );
    }

    #[test]
    fn test_every_operation_decodes() {
        for op in [
            ListOp::Init(vec![1, 2, 3]),
            ListOp::AddRange(vec![4]),
            ListOp::RemoveRange(vec![]),
            ListOp::Replace(0, 9),
            ListOp::RemoveAt(2),
            ListOp::Insert(1, 8),
            ListOp::Move(0, 1),
        ] {
            let decoded = ListOp::<u32>::decode(&mut encoded(&op)).unwrap();
            assert_eq!(decoded, op);
        }
    }

    #[test]
    fn test_null_element_list_rejected() {
        let mut writer = NetworkWriter::new();
        OperationTag::AddRange.write(&mut writer);
        writer.write(-1i32);
        let mut reader = NetworkReader::new(writer.to_bytes());
        assert!(matches!(
            ListOp::<u32>::decode(&mut reader),
            Err(ProtocolError::InvalidData(_))
        ));
    }

    #[test]
    fn test_out_of_range_leaves_items_untouched() {
        let mut items = vec![1u32, 2, 3];
        for op in [
            ListOp::Replace(3, 0),
            ListOp::RemoveAt(-1),
            ListOp::Insert(4, 0),
            ListOp::Move(0, 3),
        ] {
            assert!(matches!(
                op.apply_to(&mut items),
                Err(ProtocolError::IndexOutOfRange { len: 3, .. })
            ));
        }
        assert_eq!(items, vec![1, 2, 3]);

        // Inserting at the end is allowed
        ListOp::Insert(3, 4).apply_to(&mut items).unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_local_mutations() {
        let registry = server_registry();
        let list = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();

        list.extend([10, 20, 30]).unwrap();
        list.push(40).unwrap();
        list.set(0, 11).unwrap();
        list.insert(1, 15).unwrap();
        list.remove_at(2).unwrap();
        list.move_item(0, 3).unwrap();
        assert_eq!(list.to_vec(), vec![15, 30, 40, 11]);

        assert_eq!(list.index_of(&40), Some(2));
        assert!(list.contains(&11));
        assert_eq!(list.get(9), None);
        assert!(list.remove(&30).unwrap());
        assert!(!list.remove(&30).unwrap());

        assert!(!list.remove_range(&[15, 99]).unwrap());
        assert_eq!(list.to_vec(), vec![40, 11]);

        list.clear().unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_write_without_authority_does_not_mutate() {
        let registry = SyncRegistry::default();
        let list = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();
        assert!(matches!(list.push(1), Err(ProtocolError::Unauthorized(_))));
        assert!(list.is_empty());

        // A server cannot write a client-owned list unless it is also a client
        registry.set_server(true);
        let owned = SyncList::<u32>::new(&registry, OWNER, SyncMode::ClientOwner).unwrap();
        assert!(owned.push(1).is_err());
        assert!(owned.is_empty());
    }

    #[test]
    fn test_received_operations_apply_in_order() {
        let registry = SyncRegistry::default();
        let list = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();

        for op in [
            ListOp::Init(vec![1, 2, 3]),
            ListOp::Move(0, 2),
            ListOp::Replace(0, 7),
        ] {
            list.state.apply(&mut encoded(&op), None).unwrap();
        }
        assert_eq!(list.to_vec(), vec![7, 3, 1]);

        let mut init = NetworkWriter::new();
        list.state.write_init(&mut init).unwrap();
        let mut reader = NetworkReader::new(init.to_bytes());
        assert_eq!(
            ListOp::<u32>::decode(&mut reader).unwrap(),
            ListOp::Init(vec![7, 3, 1])
        );
    }

    #[test]
    fn test_trailing_bytes_rejected_before_mutation() {
        let registry = SyncRegistry::default();
        let list = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();

        let mut writer = NetworkWriter::new();
        ListOp::AddRange(vec![1u32]).encode(&mut writer).unwrap();
        writer.write(0u8);
        let mut reader = NetworkReader::new(writer.to_bytes());

        assert!(list.state.apply(&mut reader, None).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn test_dropping_the_list_frees_its_id() {
        let registry = SyncRegistry::default();
        let first = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();
        let id = first.object().id();
        drop(first);
        assert!(!registry.contains(OWNER, id));
        let second = SyncList::<u32>::new(&registry, OWNER, SyncMode::ServerOwner).unwrap();
        assert_eq!(second.object().id(), id);
    }
}
