//! Gate, criterion, and submission records

use chrono::{DateTime, Utc};
use guild_types::{AgentId, CriterionId, GateId, MoleculeId, StepId, SubmissionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a gate turns auto-check results into a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoApprovalPolicy {
    /// Never auto-approve; a human (or delegated decider) rules.
    #[default]
    Manual,
    /// Approve only when every required criterion has an auto-check
    /// and every one of them passed. A required criterion without an
    /// auto-check, or an empty required set, keeps the submission
    /// pending rather than rubber-stamping it.
    Strict,
    /// Approve when confidence reaches the gate's minimum.
    Lenient,
    /// Approve when all present auto-checks passed and no required
    /// criterion lacks one.
    AutoChecksOnly,
}

/// One thing the gate checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Criterion {
    pub id: CriterionId,
    pub description: String,
    pub required: bool,
    /// Predicate over submission artifacts; see [`crate::check`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_check: Option<String>,
}

impl Criterion {
    pub fn required(description: impl Into<String>) -> Self {
        Self {
            id: CriterionId::generate(),
            description: description.into(),
            required: true,
            auto_check: None,
        }
    }

    pub fn optional(description: impl Into<String>) -> Self {
        Self {
            id: CriterionId::generate(),
            description: description.into(),
            required: false,
            auto_check: None,
        }
    }

    pub fn with_check(mut self, expression: impl Into<String>) -> Self {
        self.auto_check = Some(expression.into());
        self
    }
}

/// A quality checkpoint shared by any number of molecule steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Gate {
    pub id: GateId,
    pub name: String,
    pub criteria: Vec<Criterion>,
    pub policy: AutoApprovalPolicy,
    /// Minimum confidence for auto-approval under `Lenient`.
    pub minimum_confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of evaluating one criterion for one submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: CriterionId,
    pub required: bool,
    /// Whether an auto-check ran at all.
    pub auto_checked: bool,
    pub passed: bool,
}

/// Lifecycle of a submission. Forward-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    Pending,
    Evaluating,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, SubmissionStatus::Approved | SubmissionStatus::Rejected)
    }
}

/// One attempt to pass a gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub gate_id: GateId,
    pub molecule_id: MoleculeId,
    pub step_id: StepId,
    pub submitter: AgentId,
    /// Named artifacts the auto-checks run against.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub results: Vec<CriterionResult>,
    /// Fraction of criteria weight satisfied by auto-checks.
    pub confidence: f64,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
}

impl Submission {
    pub fn new(
        gate_id: GateId,
        molecule_id: MoleculeId,
        step_id: StepId,
        submitter: AgentId,
        artifacts: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: SubmissionId::generate(),
            gate_id,
            molecule_id,
            step_id,
            submitter,
            artifacts,
            status: SubmissionStatus::Pending,
            results: Vec::new(),
            confidence: 0.0,
            submitted_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            decision_reason: None,
        }
    }
}
