//! Ledger entries
//!
//! An entry records one event against one entity. Event kinds are
//! open-ended strings owned by the emitting subsystem (the hook
//! manager writes `work_item_claimed`, the molecule engine
//! `step_completed`, and so on); entity kinds are a closed set.

use chrono::{DateTime, Utc};
use guild_types::EntryId;
use serde::{Deserialize, Serialize};

/// The kind of entity an entry is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Molecule,
    Step,
    WorkItem,
    Hook,
    Message,
    Gate,
    Submission,
    Contract,
    Agent,
    System,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Molecule => "molecule",
            EntityKind::Step => "step",
            EntityKind::WorkItem => "work_item",
            EntityKind::Hook => "hook",
            EntityKind::Message => "message",
            EntityKind::Gate => "gate",
            EntityKind::Submission => "submission",
            EntityKind::Contract => "contract",
            EntityKind::Agent => "agent",
            EntityKind::System => "system",
        };
        write!(f, "{name}")
    }
}

/// One immutable ledger entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stable identifier, usable as a causal parent reference.
    pub id: EntryId,
    /// Gap-free, strictly monotonic position in the log.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Who caused the event (an agent id, or a component name such as
    /// "scheduler").
    pub actor: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub event_kind: String,
    pub payload: serde_json::Value,
    /// Causal parent, for chains like claim → checkpoint → reclaim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntryId>,
    /// Hash of the previous entry; `None` only for sequence 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// blake3 over the entry content (everything but this field).
    pub hash: String,
}

impl LedgerEntry {
    /// Recompute this entry's content hash.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        content_hash(
            self.sequence,
            &self.timestamp,
            &self.actor,
            self.entity_kind,
            &self.entity_id,
            &self.event_kind,
            &self.payload,
            self.parent.as_ref(),
            self.previous_hash.as_deref(),
        )
    }

    /// True if the stored hash matches the content.
    pub fn verify(&self) -> bool {
        self.compute_hash()
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }
}

/// Hash of the canonical serialization of an entry's content fields.
#[allow(clippy::too_many_arguments)]
pub(crate) fn content_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    actor: &str,
    entity_kind: EntityKind,
    entity_id: &str,
    event_kind: &str,
    payload: &serde_json::Value,
    parent: Option<&EntryId>,
    previous_hash: Option<&str>,
) -> Result<String, serde_json::Error> {
    let canonical = serde_json::json!({
        "sequence": sequence,
        "timestamp": timestamp,
        "actor": actor,
        "entity_kind": entity_kind,
        "entity_id": entity_id,
        "event_kind": event_kind,
        "payload": payload,
        "parent": parent,
        "previous_hash": previous_hash,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry() -> LedgerEntry {
        let mut entry = LedgerEntry {
            id: EntryId::generate(),
            sequence: 1,
            timestamp: Utc::now(),
            actor: "scheduler".to_string(),
            entity_kind: EntityKind::WorkItem,
            entity_id: "item-1".to_string(),
            event_kind: "work_item_scheduled".to_string(),
            payload: serde_json::json!({"agent": "w1"}),
            parent: None,
            previous_hash: None,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash().unwrap();
        entry
    }

    #[test]
    fn hash_verifies_and_detects_tampering() {
        let mut entry = make_entry();
        assert!(entry.verify());

        entry.payload = serde_json::json!({"agent": "someone-else"});
        assert!(!entry.verify());
    }

    #[test]
    fn hash_covers_previous_hash() {
        let mut entry = make_entry();
        entry.previous_hash = Some("deadbeef".to_string());
        assert!(!entry.verify());
    }
}
