//! Steps and checkpoints

use chrono::{DateTime, Utc};
use guild_types::{FailureBead, GateId, OwnerId, Priority, StepId, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An append-only progress marker within a step. Checkpoints are how
/// partial work survives a crash, and how persistent-retry feeds
/// failure context into the next attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub description: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(description: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            description: description.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// A unit of work within a molecule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub status: StepStatus,
    /// Step ids within the same molecule this step waits on.
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Agent or pool the work is destined for; `None` lets the
    /// scheduler pick by capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<OwnerId>,
    pub priority: Priority,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Append-only progress markers.
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub is_gate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<GateId>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// Failure taxonomy beads, recorded for the learning sink.
    #[serde(default)]
    pub failures: Vec<FailureBead>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: StepId::generate(),
            name: name.into(),
            status: StepStatus::Pending,
            depends_on: Vec::new(),
            assignee: None,
            priority: Priority::default(),
            required_capabilities: BTreeSet::new(),
            checkpoints: Vec::new(),
            is_gate: false,
            gate_id: None,
            retry_count: 0,
            max_retries: 3,
            failures: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Record a checkpoint. Append-only by construction.
    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
