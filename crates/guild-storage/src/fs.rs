//! Filesystem record store
//!
//! One directory per record kind under a configurable root, one
//! pretty-printed JSON file per record. Writes land in a temp file
//! first, are synced, and then renamed over the destination so a crash
//! mid-write never leaves a torn record behind.

use crate::traits::{RecordEnvelope, RecordKind, RecordStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Record store rooted at a directory on the local filesystem.
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.root.join(kind.path()).join(format!("{id}.json"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(dir)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn put(&self, kind: RecordKind, id: &str, body: serde_json::Value) -> StorageResult<()> {
        let envelope = RecordEnvelope::wrap(body);
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        let path = self.record_path(kind, id);
        self.write_atomic(&path, &bytes)?;
        debug!(kind = kind.path(), id, "record written");
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> StorageResult<Option<serde_json::Value>> {
        let path = self.record_path(kind, id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let envelope: RecordEnvelope = serde_json::from_slice(&bytes)?;
        Ok(Some(envelope.open()?))
    }

    async fn remove(&self, kind: RecordKind, id: &str) -> StorageResult<()> {
        let path = self.record_path(kind, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, kind: RecordKind) -> StorageResult<Vec<(String, serde_json::Value)>> {
        let dir = self.root.join(kind.path());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            let envelope: RecordEnvelope = serde_json::from_slice(&bytes)?;
            records.push((id, envelope.open()?));
        }
        Ok(records)
    }
}
