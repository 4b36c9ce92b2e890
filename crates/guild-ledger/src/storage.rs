//! Ledger storage backends
//!
//! The ledger persists as JSON-lines files bucketed by month
//! (`ledger/2026-08.log`). Buckets are append-only; the filesystem
//! backend fsyncs after every append so an entry is durable before
//! `append` returns.

use crate::{LedgerError, LedgerResult};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Storage backend for append-only ledger buckets.
pub trait LedgerStorage: Send + Sync {
    /// Append one line (without trailing newline) to a bucket,
    /// durably.
    fn append_line(&self, bucket: &str, line: &[u8]) -> LedgerResult<()>;

    /// Bucket names in ascending order.
    fn list_buckets(&self) -> LedgerResult<Vec<String>>;

    /// All lines of a bucket, in append order.
    fn read_bucket(&self, bucket: &str) -> LedgerResult<Vec<String>>;
}

// ── Filesystem backend ───────────────────────────────────────────────

/// Month-bucketed JSON-lines files under `<root>/`.
pub struct FsLedgerStorage {
    root: PathBuf,
}

impl FsLedgerStorage {
    pub fn open(root: impl Into<PathBuf>) -> LedgerResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(format!("{bucket}.log"))
    }
}

impl LedgerStorage for FsLedgerStorage {
    fn append_line(&self, bucket: &str, line: &[u8]) -> LedgerResult<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bucket_path(bucket))?;
        file.write_all(line)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    fn list_buckets(&self) -> LedgerResult<Vec<String>> {
        let mut buckets = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(bucket) = name.strip_suffix(".log") {
                buckets.push(bucket.to_string());
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    fn read_bucket(&self, bucket: &str) -> LedgerResult<Vec<String>> {
        let path = self.bucket_path(bucket);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(contents.lines().map(String::from).collect())
    }
}

// ── In-memory backend (for testing) ──────────────────────────────────

/// In-memory bucket map with the same append-only surface.
#[derive(Default)]
pub struct MemoryLedgerStorage {
    buckets: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> LedgerError {
        LedgerError::Storage("bucket lock poisoned".to_string())
    }
}

impl LedgerStorage for MemoryLedgerStorage {
    fn append_line(&self, bucket: &str, line: &[u8]) -> LedgerResult<()> {
        let line = String::from_utf8(line.to_vec())
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;
        let mut guard = self.buckets.lock().map_err(|_| Self::lock_err())?;
        guard.entry(bucket.to_string()).or_default().push(line);
        Ok(())
    }

    fn list_buckets(&self) -> LedgerResult<Vec<String>> {
        let guard = self.buckets.lock().map_err(|_| Self::lock_err())?;
        Ok(guard.keys().cloned().collect())
    }

    fn read_bucket(&self, bucket: &str) -> LedgerResult<Vec<String>> {
        let guard = self.buckets.lock().map_err(|_| Self::lock_err())?;
        Ok(guard.get(bucket).cloned().unwrap_or_default())
    }
}
