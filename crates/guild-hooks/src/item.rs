//! Work items
//!
//! A work item is the schedulable unit placed into a hook: one step of
//! one molecule, with the priority, capability requirements, and retry
//! budget the scheduler needs.

use chrono::{DateTime, Utc};
use guild_types::{MoleculeId, Priority, StepId, WorkItemId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A schedulable unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub molecule_id: MoleculeId,
    pub step_id: StepId,
    pub priority: Priority,
    /// Capabilities an agent must hold to receive this item.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// What the assignee is being asked to do.
    pub instruction: String,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    /// Estimated cost of one attempt, for cost-cap accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    /// When the current claim was taken, if in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(
        molecule_id: MoleculeId,
        step_id: StepId,
        priority: Priority,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkItemId::generate(),
            molecule_id,
            step_id,
            priority,
            required_capabilities: BTreeSet::new(),
            instruction: instruction.into(),
            max_retries: 3,
            retry_count: 0,
            estimated_cost: None,
            claimed_at: None,
            deadline: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget() {
        let mut item = WorkItem::new(
            MoleculeId::new("m1"),
            StepId::new("s1"),
            Priority::P2,
            "do the thing",
        )
        .with_max_retries(2);

        assert!(!item.retries_exhausted());
        item.retry_count = 2;
        assert!(item.retries_exhausted());
    }

    #[test]
    fn deadline_check() {
        let item = WorkItem::new(
            MoleculeId::new("m1"),
            StepId::new("s1"),
            Priority::P0,
            "urgent",
        )
        .with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(item.past_deadline(Utc::now()));
    }
}
