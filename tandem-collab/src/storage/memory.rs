//! In-process document store.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{DocumentRecord, DocumentStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, DocumentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory store lock poisoned".into())
}

impl DocumentStore for MemoryStore {
    fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&id).cloned())
    }

    fn insert(&self, record: DocumentRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    fn compare_and_set(
        &self,
        expected: &DocumentRecord,
        record: DocumentRecord,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let stored = records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        if stored != expected {
            return Ok(false);
        }
        *stored = record;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.keys().copied().collect())
    }
}
