//! The ledger facade
//!
//! A single serialized writer assigns sequence numbers and chains
//! hashes; readers work off the in-memory index that mirrors the
//! durable log. On open, the buckets are scanned in order and the
//! index is rebuilt; the scan stops at the first entry that fails
//! verification, which is how a torn tail from a crash is dropped.

use crate::entry::{content_hash, EntityKind, LedgerEntry};
use crate::storage::LedgerStorage;
use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use guild_types::EntryId;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Transient append failures retry this many times before surfacing.
const APPEND_RETRIES: u32 = 3;

/// Filter for [`Ledger::query`].
#[derive(Clone, Debug, Default)]
pub struct LedgerQuery {
    pub entity_id: Option<String>,
    pub entity_kind: Option<EntityKind>,
    pub since: Option<u64>,
}

/// Result of a chain verification pass.
#[derive(Clone, Debug)]
pub struct ChainReport {
    pub checked: u64,
    /// Sequence of the first entry that failed verification, if any.
    pub broken_at: Option<u64>,
}

impl ChainReport {
    pub fn is_clean(&self) -> bool {
        self.broken_at.is_none()
    }
}

struct LedgerState {
    entries: Vec<LedgerEntry>,
    last_hash: Option<String>,
}

/// Durable, ordered, append-only event storage.
pub struct Ledger {
    storage: Box<dyn LedgerStorage>,
    state: RwLock<LedgerState>,
}

impl Ledger {
    /// Open a ledger over the given backend, rebuilding the index
    /// from whatever the backend already holds.
    pub fn open(storage: Box<dyn LedgerStorage>) -> LedgerResult<Self> {
        let mut entries: Vec<LedgerEntry> = Vec::new();
        let mut last_hash: Option<String> = None;

        'scan: for bucket in storage.list_buckets()? {
            for line in storage.read_bucket(&bucket)? {
                let entry: LedgerEntry = match serde_json::from_str(&line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(bucket, error = %err, "unparseable ledger line, stopping scan");
                        break 'scan;
                    }
                };

                let expected_sequence = entries.len() as u64 + 1;
                if entry.sequence != expected_sequence
                    || entry.previous_hash != last_hash
                    || !entry.verify()
                {
                    warn!(
                        bucket,
                        sequence = entry.sequence,
                        "entry fails verification, stopping scan"
                    );
                    break 'scan;
                }

                last_hash = Some(entry.hash.clone());
                entries.push(entry);
            }
        }

        info!(recovered = entries.len(), "ledger opened");
        Ok(Self {
            storage,
            state: RwLock::new(LedgerState { entries, last_hash }),
        })
    }

    /// Append an entry. The entry is durable before this returns.
    pub async fn append(
        &self,
        actor: impl Into<String>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        event_kind: impl Into<String>,
        payload: serde_json::Value,
        parent: Option<EntryId>,
    ) -> LedgerResult<LedgerEntry> {
        let actor = actor.into();
        let entity_id = entity_id.into();
        let event_kind = event_kind.into();
        let timestamp = Utc::now();

        let mut state = self.state.write().await;
        let sequence = state.entries.len() as u64 + 1;
        let previous_hash = state.last_hash.clone();

        let hash = content_hash(
            sequence,
            &timestamp,
            &actor,
            entity_kind,
            &entity_id,
            &event_kind,
            &payload,
            parent.as_ref(),
            previous_hash.as_deref(),
        )?;

        let entry = LedgerEntry {
            id: EntryId::generate(),
            sequence,
            timestamp,
            actor,
            entity_kind,
            entity_id,
            event_kind,
            payload,
            parent,
            previous_hash,
            hash,
        };

        let line = serde_json::to_vec(&entry)?;
        let bucket = bucket_for(&entry.timestamp);
        self.append_with_retry(&bucket, &line).await?;

        state.last_hash = Some(entry.hash.clone());
        state.entries.push(entry.clone());

        debug!(
            sequence = entry.sequence,
            entity = %entry.entity_kind,
            event = %entry.event_kind,
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// All entries with sequence ≥ `sequence`, in order.
    pub async fn read_since(&self, sequence: u64) -> Vec<LedgerEntry> {
        let state = self.state.read().await;
        let start = sequence.saturating_sub(1) as usize;
        state.entries.get(start..).unwrap_or(&[]).to_vec()
    }

    /// Filtered lookup.
    pub async fn query(&self, query: &LedgerQuery) -> Vec<LedgerEntry> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|entry| {
                if let Some(ref id) = query.entity_id {
                    if &entry.entity_id != id {
                        return false;
                    }
                }
                if let Some(kind) = query.entity_kind {
                    if entry.entity_kind != kind {
                        return false;
                    }
                }
                if let Some(since) = query.since {
                    if entry.sequence < since {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Sequence of the most recent entry (0 when empty).
    pub async fn latest_sequence(&self) -> u64 {
        self.state.read().await.entries.len() as u64
    }

    /// Recompute every hash and the chain links.
    pub async fn verify_chain(&self) -> ChainReport {
        let state = self.state.read().await;
        let mut previous: Option<&str> = None;
        for entry in &state.entries {
            if !entry.verify() || entry.previous_hash.as_deref() != previous {
                return ChainReport {
                    checked: entry.sequence,
                    broken_at: Some(entry.sequence),
                };
            }
            previous = Some(&entry.hash);
        }
        ChainReport {
            checked: state.entries.len() as u64,
            broken_at: None,
        }
    }

    /// Replay entries from `from` (inclusive) through a handler, for
    /// rebuilding dependent stores after a crash.
    pub async fn replay<F>(&self, from: u64, mut handler: F) -> LedgerResult<u64>
    where
        F: FnMut(&LedgerEntry) -> LedgerResult<()>,
    {
        let entries = self.read_since(from).await;
        let mut count = 0u64;
        for entry in &entries {
            handler(entry)?;
            count += 1;
        }
        info!(replayed = count, from, "ledger replay complete");
        Ok(count)
    }

    async fn append_with_retry(&self, bucket: &str, line: &[u8]) -> LedgerResult<()> {
        let mut attempt = 0;
        loop {
            match self.storage.append_line(bucket, line) {
                Ok(()) => return Ok(()),
                Err(LedgerError::Io(err)) if attempt < APPEND_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %err, "ledger append failed, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Bucket name for a timestamp: one bucket per month.
fn bucket_for(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m").to_string()
}
