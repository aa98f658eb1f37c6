//! Storage backend contract and a reference in-memory implementation.
//!
//! The engine core never writes files itself; it drives an implementor of
//! [`StorageBackend`] from the data handler's single writer thread. Because
//! `put` calls are serialized by that thread, backends do not need their own
//! write-side locking. `get_data`, `get_metadata`, and `contains` may be
//! called concurrently with each other (the handler wraps the backend in a
//! read/write lock to make that safe for plain-struct backends).

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;

use super::coords::DataCoordinates;
use super::DataBuffer;

/// Capability set a storage backend must offer.
pub trait StorageBackend: Send + Sync + 'static {
    /// Persist one item. May block. Once `put` returns, the item must be
    /// readable through `get_data`/`get_metadata`.
    fn put(&mut self, coords: &DataCoordinates, data: &DataBuffer, metadata: &Value)
        -> Result<()>;

    fn get_data(&self, coords: &DataCoordinates) -> Option<DataBuffer>;

    fn get_metadata(&self, coords: &DataCoordinates) -> Option<Value>;

    fn contains(&self, coords: &DataCoordinates) -> bool;

    /// No more data will be added; the dataset becomes read-only.
    fn finish(&mut self) -> Result<()>;

    /// Release resources. No reads or writes after this.
    fn close(&mut self) -> Result<()>;
}

/// RAM-backed storage, useful for tests and short-lived acquisitions.
#[derive(Default)]
pub struct MemoryStorage {
    items: HashMap<DataCoordinates, (DataBuffer, Value)>,
    finished: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(
        &mut self,
        coords: &DataCoordinates,
        data: &DataBuffer,
        metadata: &Value,
    ) -> Result<()> {
        if self.finished {
            return Err(anyhow!("dataset is finished; no further writes accepted"));
        }
        self.items
            .insert(coords.clone(), (data.clone(), metadata.clone()));
        Ok(())
    }

    fn get_data(&self, coords: &DataCoordinates) -> Option<DataBuffer> {
        self.items.get(coords).map(|(data, _)| data.clone())
    }

    fn get_metadata(&self, coords: &DataCoordinates) -> Option<Value> {
        self.items.get(coords).map(|(_, metadata)| metadata.clone())
    }

    fn contains(&self, coords: &DataCoordinates) -> bool {
        self.items.contains_key(coords)
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let mut storage = MemoryStorage::new();
        let coords = DataCoordinates::new().with("time", 0);
        storage
            .put(&coords, &DataBuffer::U8(vec![7]), &serde_json::json!({}))
            .expect("put");
        assert!(storage.contains(&coords));
        assert_eq!(storage.get_data(&coords), Some(DataBuffer::U8(vec![7])));
    }

    #[test]
    fn test_put_after_finish_fails() {
        let mut storage = MemoryStorage::new();
        storage.finish().expect("finish");
        let coords = DataCoordinates::new().with("time", 0);
        let result = storage.put(&coords, &DataBuffer::U8(vec![]), &Value::Null);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_coords_absent() {
        let storage = MemoryStorage::new();
        let coords = DataCoordinates::new().with("time", 42);
        assert!(!storage.contains(&coords));
        assert!(storage.get_data(&coords).is_none());
        assert!(storage.get_metadata(&coords).is_none());
    }
}
