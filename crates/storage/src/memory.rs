use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
struct Inner {
    map: MemoryStoreMap,
    column_bytes: [u64; Column::ALL.len()],
}

impl Inner {
    fn put(&mut self, column: Column, key: &[u8], value: &[u8]) {
        let replaced = self.map.insert((column, key.to_vec()), value.to_vec());
        let slot = &mut self.column_bytes[column.index()];
        if let Some(old) = replaced {
            *slot -= (key.len() + old.len()) as u64;
        }
        *slot += (key.len() + value.len()) as u64;
    }

    fn delete(&mut self, column: Column, key: &[u8]) {
        if let Some(old) = self.map.remove(&(column, key.to_vec())) {
            self.column_bytes[column.index()] -= (key.len() + old.len()) as u64;
        }
    }
}

/// In-memory backend for tests and throwaway chain state. A running byte
/// count per column keeps size estimates O(1) rather than a scan.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.map.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.put(column, key, value);
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.delete(column, key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        // Matching keys sit contiguously from (column, prefix) onward.
        for ((entry_column, key), value) in guard.map.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.put(*column, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    guard.delete(*column, key.as_slice());
                }
            }
        }
        Ok(())
    }

    fn size_estimate(&self, column: Column) -> u64 {
        let guard = self.inner.read().expect("memory store lock");
        guard.column_bytes[column.index()]
    }
}
