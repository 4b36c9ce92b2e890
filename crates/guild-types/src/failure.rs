//! Failure taxonomy recorded on failed steps
//!
//! The core records these classifications as metadata for downstream
//! learning systems; it never interprets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What went wrong, in the vocabulary shared with the learning sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PromptAmbiguity,
    LogicError,
    Hallucination,
    CostOverrun,
    Timeout,
    ExternalDependency,
    ContextDrift,
    CapabilityMismatch,
}

/// How the failure ended up, as later judged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    Resolved,
    Recurring,
    #[default]
    Unresolved,
}

/// One recorded failure on a step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureBead {
    pub kind: FailureKind,
    pub outcome: FailureOutcome,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureBead {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            outcome: FailureOutcome::Unresolved,
            detail: detail.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn resolved(mut self) -> Self {
        self.outcome = FailureOutcome::Resolved;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bead_starts_unresolved() {
        let bead = FailureBead::new(FailureKind::Timeout, "llm call exceeded deadline");
        assert_eq!(bead.outcome, FailureOutcome::Unresolved);
        assert_eq!(bead.kind, FailureKind::Timeout);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::PromptAmbiguity).unwrap();
        assert_eq!(json, "\"prompt_ambiguity\"");
    }
}
