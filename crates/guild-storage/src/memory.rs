//! In-memory record store for tests
//!
//! Deterministic and lock-cheap; keeps the same envelope discipline as
//! the filesystem backend so schema-mismatch paths stay testable.

use crate::traits::{RecordEnvelope, RecordKind, RecordStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<(RecordKind, String), RecordEnvelope>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> StorageError {
        StorageError::Backend("record lock poisoned".to_string())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> StorageResult<()> {
        let mut guard = self.records.write().map_err(|_| Self::lock_err())?;
        guard.insert((kind, id.to_string()), RecordEnvelope::wrap(body));
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> StorageResult<Option<serde_json::Value>> {
        let guard = self.records.read().map_err(|_| Self::lock_err())?;
        match guard.get(&(kind, id.to_string())) {
            Some(envelope) => Ok(Some(envelope.clone().open()?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, kind: RecordKind, id: &str) -> StorageResult<()> {
        let mut guard = self.records.write().map_err(|_| Self::lock_err())?;
        guard.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn list(&self, kind: RecordKind) -> StorageResult<Vec<(String, serde_json::Value)>> {
        let guard = self.records.read().map_err(|_| Self::lock_err())?;
        let mut records = Vec::new();
        for ((k, id), envelope) in guard.iter() {
            if *k == kind {
                records.push((id.clone(), envelope.clone().open()?));
            }
        }
        Ok(records)
    }
}
