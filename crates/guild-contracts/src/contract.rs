//! Contract records

use chrono::{DateTime, Utc};
use guild_types::{ContractId, MoleculeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a contract version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    #[default]
    Draft,
    Active,
    Completed,
    Failed,
    /// Superseded by a newer version; retained immutably.
    Amended,
}

/// When success criteria are validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Checked once, at completion.
    #[default]
    OneTime,
    /// Re-validated continuously while the molecule runs.
    Continuous,
    /// Re-validated on a fixed cadence.
    Periodic,
}

/// One boolean completion criterion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub met: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl SuccessCriterion {
    pub fn required(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            required: true,
            met: false,
            verified_by: None,
            verified_at: None,
        }
    }

    pub fn optional(description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(description)
        }
    }
}

/// A criterion re-checked during continuous validation.
///
/// The check is a predicate over a caller-supplied context map:
/// `context:<key>` (present and non-empty) or
/// `context:<key>=<value>` (exact match).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContinuousCriterion {
    pub description: String,
    pub check: String,
}

/// A versioned success contract, 1:1 with a molecule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub molecule_id: MoleculeId,
    pub version: u32,
    pub status: ContractStatus,
    pub objective: String,
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub in_scope: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub validation_mode: ValidationMode,
    #[serde(default)]
    pub continuous_criteria: Vec<ContinuousCriterion>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub escalation_threshold: u32,
    /// The version this one amended, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<ContractId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Contract {
    /// True when every required criterion has been checked off.
    pub fn all_required_met(&self) -> bool {
        self.success_criteria
            .iter()
            .filter(|c| c.required)
            .all(|c| c.met)
    }
}

/// Result of one continuous validation pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    /// Descriptions of the criteria that failed this pass.
    pub failures: Vec<String>,
    pub consecutive_failures: u32,
    /// Present when the failure run crossed the threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationSignal>,
}

/// Raised when a continuous contract keeps failing; the runtime sends
/// this upchain from the molecule's accountable agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationSignal {
    pub contract_id: ContractId,
    pub molecule_id: MoleculeId,
    pub consecutive_failures: u32,
    pub detail: String,
}

/// Evaluate a continuous-criterion check expression.
pub(crate) fn evaluate_check(expression: &str, context: &BTreeMap<String, String>) -> bool {
    if let Some(rest) = expression.strip_prefix("context:") {
        return match rest.split_once('=') {
            Some((key, expected)) => context.get(key).map(String::as_str) == Some(expected),
            None => context.get(rest).map(|v| !v.is_empty()).unwrap_or(false),
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_criteria_gate_completion() {
        let contract = Contract {
            id: ContractId::generate(),
            molecule_id: MoleculeId::new("m1"),
            version: 1,
            status: ContractStatus::Active,
            objective: "ship it".into(),
            success_criteria: vec![
                SuccessCriterion::required("feature works"),
                SuccessCriterion::optional("docs written"),
            ],
            in_scope: vec![],
            out_of_scope: vec![],
            constraints: vec![],
            validation_mode: ValidationMode::OneTime,
            continuous_criteria: vec![],
            consecutive_failures: 0,
            escalation_threshold: 3,
            previous_version: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(!contract.all_required_met());

        let mut contract = contract;
        contract.success_criteria[0].met = true;
        // The optional criterion does not block.
        assert!(contract.all_required_met());
    }

    #[test]
    fn context_checks() {
        let mut context = BTreeMap::new();
        context.insert("uptime".to_string(), "ok".to_string());
        assert!(evaluate_check("context:uptime", &context));
        assert!(evaluate_check("context:uptime=ok", &context));
        assert!(!evaluate_check("context:uptime=degraded", &context));
        assert!(!evaluate_check("context:latency", &context));
        assert!(!evaluate_check("garbage", &context));
    }
}
