//! The record-store contract
//!
//! Records are schemaless JSON bodies wrapped in an envelope that
//! carries the schema version and write timestamp. Compatibility is
//! additive within a major version: fields are never removed or
//! repurposed, and a record written by an incompatible major version
//! is refused at read time rather than misinterpreted.

use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current record schema major version.
pub const SCHEMA_VERSION: u32 = 1;

/// Logical store a record belongs to. Each kind maps to one directory
/// in the filesystem backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    MoleculeActive,
    MoleculeCompleted,
    MoleculeTemplate,
    Hook,
    Channel,
    Gate,
    Submission,
    Contract,
    Metrics,
    Org,
}

impl RecordKind {
    /// Directory path for this kind, relative to the store root.
    pub fn path(&self) -> &'static str {
        match self {
            RecordKind::MoleculeActive => "molecules/active",
            RecordKind::MoleculeCompleted => "molecules/completed",
            RecordKind::MoleculeTemplate => "molecules/templates",
            RecordKind::Hook => "hooks",
            RecordKind::Channel => "channels",
            RecordKind::Gate => "gates",
            RecordKind::Submission => "submissions",
            RecordKind::Contract => "contracts",
            RecordKind::Metrics => "metrics",
            RecordKind::Org => "org",
        }
    }
}

/// Envelope persisted around every record body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

impl RecordEnvelope {
    pub fn wrap(body: serde_json::Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            written_at: Utc::now(),
            body,
        }
    }

    /// Unwrap the body, refusing incompatible schema versions.
    pub fn open(self) -> StorageResult<serde_json::Value> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        Ok(self.body)
    }
}

/// Durable key-value record storage, one namespace per [`RecordKind`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write (or replace) a record.
    async fn put(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> StorageResult<()>;

    /// Read a record body, if present.
    async fn get(&self, kind: RecordKind, id: &str) -> StorageResult<Option<serde_json::Value>>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn remove(&self, kind: RecordKind, id: &str) -> StorageResult<()>;

    /// List all `(id, body)` pairs of a kind, in unspecified order.
    async fn list(&self, kind: RecordKind) -> StorageResult<Vec<(String, serde_json::Value)>>;

    /// Move a record between kinds (e.g. an active molecule to
    /// completed). Fails with `NotFound` if the source is missing.
    async fn move_record(&self, from: RecordKind, to: RecordKind, id: &str) -> StorageResult<()> {
        let body = self
            .get(from, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", from.path(), id)))?;
        self.put(to, id, body).await?;
        self.remove(from, id).await
    }
}

/// Typed convenience wrappers over the JSON surface.
pub async fn put_typed<T: Serialize>(
    store: &dyn RecordStore,
    kind: RecordKind,
    id: &str,
    value: &T,
) -> StorageResult<()> {
    store.put(kind, id, serde_json::to_value(value)?).await
}

pub async fn get_typed<T: for<'de> Deserialize<'de>>(
    store: &dyn RecordStore,
    kind: RecordKind,
    id: &str,
) -> StorageResult<Option<T>> {
    match store.get(kind, id).await? {
        Some(body) => Ok(Some(serde_json::from_value(body)?)),
        None => Ok(None),
    }
}
