//! Shared lifecycle vocabulary
//!
//! Molecule and step statuses are referenced across subsystem
//! boundaries (contracts gate their activation on molecule status,
//! the scheduler checks step readiness), so the enums live here
//! rather than in the engine crate.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a molecule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoleculeStatus {
    #[default]
    Draft,
    Pending,
    Active,
    Completed,
    Failed,
    Paused,
}

impl MoleculeStatus {
    /// Terminal for linear molecules; continuous molecules re-enter
    /// `Active` from `Completed` at iteration boundaries.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MoleculeStatus::Completed | MoleculeStatus::Failed)
    }
}

impl std::fmt::Display for MoleculeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MoleculeStatus::Draft => "draft",
            MoleculeStatus::Pending => "pending",
            MoleculeStatus::Active => "active",
            MoleculeStatus::Completed => "completed",
            MoleculeStatus::Failed => "failed",
            MoleculeStatus::Paused => "paused",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    /// All dependencies completed or skipped; eligible for scheduling.
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// A dependency in this state no longer blocks its dependents.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// The topology family of a molecule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Linear,
    Continuous,
    Hybrid,
    Swarm,
    Composite,
    PersistentRetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(MoleculeStatus::Completed.is_terminal());
        assert!(MoleculeStatus::Failed.is_terminal());
        assert!(!MoleculeStatus::Paused.is_terminal());
        assert!(!MoleculeStatus::Active.is_terminal());
    }

    #[test]
    fn skipped_satisfies_dependencies() {
        assert!(StepStatus::Skipped.satisfies_dependency());
        assert!(StepStatus::Completed.satisfies_dependency());
        assert!(!StepStatus::Ready.satisfies_dependency());
    }
}
