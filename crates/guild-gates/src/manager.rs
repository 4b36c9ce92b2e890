//! The gate manager
//!
//! Owns gate definitions and submissions. Evaluation runs
//! synchronously on submit (the submission passes through
//! `evaluating` and lands on `approved` or back on `pending`);
//! manual decisions arrive later through [`GateManager::decide`].
//! Each submission sits behind its own lock so two writers can never
//! evaluate the same submission concurrently.

use crate::check;
use crate::gate::{
    AutoApprovalPolicy, Criterion, CriterionResult, Gate, Submission, SubmissionStatus,
};
use crate::{GateError, GateResult};
use chrono::Utc;
use guild_ledger::{EntityKind, Ledger};
use guild_storage::{RecordKind, RecordStore};
use guild_types::{AgentId, GateId, MoleculeId, StepId, SubmissionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Manager of gates and their submissions.
pub struct GateManager {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    gates: RwLock<HashMap<GateId, Gate>>,
    submissions: RwLock<HashMap<SubmissionId, Arc<Mutex<Submission>>>>,
}

impl GateManager {
    /// Open the manager, loading persisted gates and submissions.
    pub async fn open(ledger: Arc<Ledger>, store: Arc<dyn RecordStore>) -> GateResult<Self> {
        let mut gates = HashMap::new();
        for (_, body) in store.list(RecordKind::Gate).await? {
            let gate: Gate =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            gates.insert(gate.id.clone(), gate);
        }

        let mut submissions = HashMap::new();
        for (_, body) in store.list(RecordKind::Submission).await? {
            let submission: Submission =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            submissions.insert(submission.id.clone(), Arc::new(Mutex::new(submission)));
        }

        Ok(Self {
            ledger,
            store,
            gates: RwLock::new(gates),
            submissions: RwLock::new(submissions),
        })
    }

    // ── Gate definitions ─────────────────────────────────────────────

    /// Create a gate. Gates need at least one criterion; an empty
    /// gate could only ever rubber-stamp.
    pub async fn create_gate(
        &self,
        name: impl Into<String>,
        criteria: Vec<Criterion>,
        policy: AutoApprovalPolicy,
        minimum_confidence: f64,
    ) -> GateResult<Gate> {
        if criteria.is_empty() {
            return Err(GateError::InvalidState(
                "a gate needs at least one criterion".to_string(),
            ));
        }

        let gate = Gate {
            id: GateId::generate(),
            name: name.into(),
            criteria,
            policy,
            minimum_confidence: minimum_confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        };

        self.ledger
            .append(
                "gate-manager",
                EntityKind::Gate,
                gate.id.as_str(),
                "gate_created",
                serde_json::json!({
                    "name": gate.name,
                    "policy": gate.policy,
                    "criteria": gate.criteria.len(),
                }),
                None,
            )
            .await?;

        let body = serde_json::to_value(&gate).map_err(guild_storage::StorageError::from)?;
        self.store.put(RecordKind::Gate, gate.id.as_str(), body).await?;

        let mut gates = self.gates.write().await;
        gates.insert(gate.id.clone(), gate.clone());
        info!(gate = %gate.id, name = %gate.name, "gate created");
        Ok(gate)
    }

    pub async fn get_gate(&self, gate_id: &GateId) -> GateResult<Gate> {
        self.gates
            .read()
            .await
            .get(gate_id)
            .cloned()
            .ok_or_else(|| GateError::GateNotFound(gate_id.clone()))
    }

    pub async fn list_gates(&self) -> Vec<Gate> {
        let mut gates: Vec<_> = self.gates.read().await.values().cloned().collect();
        gates.sort_by(|a, b| a.id.cmp(&b.id));
        gates
    }

    // ── Submissions ──────────────────────────────────────────────────

    /// Submit artifacts against a gate and evaluate them under the
    /// gate's policy. Returns the submission in its post-evaluation
    /// state.
    pub async fn submit(
        &self,
        gate_id: &GateId,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        submitter: &AgentId,
        artifacts: BTreeMap<String, String>,
    ) -> GateResult<Submission> {
        // Fail before persisting anything if the gate is unknown.
        self.get_gate(gate_id).await?;

        let submission = Submission::new(
            gate_id.clone(),
            molecule_id.clone(),
            step_id.clone(),
            submitter.clone(),
            artifacts,
        );

        self.ledger
            .append(
                submitter.as_str(),
                EntityKind::Submission,
                submission.id.as_str(),
                "submission_created",
                serde_json::json!({
                    "gate_id": gate_id,
                    "molecule_id": molecule_id,
                    "step_id": step_id,
                    "artifacts": submission.artifacts.len(),
                }),
                None,
            )
            .await?;
        self.persist(&submission).await?;

        let id = submission.id.clone();
        {
            let mut submissions = self.submissions.write().await;
            submissions.insert(id.clone(), Arc::new(Mutex::new(submission)));
        }

        self.evaluate(&id).await?;
        self.get_submission(&id).await
    }

    /// Run the gate's auto-checks over a pending submission and apply
    /// the auto-approval policy.
    pub async fn evaluate(&self, submission_id: &SubmissionId) -> GateResult<SubmissionStatus> {
        let handle = self.submission_handle(submission_id).await?;
        let mut submission = handle.lock().await;

        if submission.status.is_final() {
            return Err(GateError::InvalidState(format!(
                "submission {} already {}",
                submission.id,
                status_name(submission.status)
            )));
        }
        let gate = self.get_gate(&submission.gate_id).await?;

        submission.status = SubmissionStatus::Evaluating;

        let results = run_checks(&gate.criteria, &submission.artifacts);
        let confidence = compute_confidence(&gate.criteria, &results);
        let approved = match gate.policy {
            AutoApprovalPolicy::Manual => false,
            AutoApprovalPolicy::Strict => strict_approves(&results),
            AutoApprovalPolicy::Lenient => confidence >= gate.minimum_confidence,
            AutoApprovalPolicy::AutoChecksOnly => auto_checks_only_approves(&results),
        };

        submission.results = results;
        submission.confidence = confidence;
        if approved {
            submission.status = SubmissionStatus::Approved;
            submission.decided_at = Some(Utc::now());
            submission.decided_by = Some("auto-approval".to_string());
        } else {
            submission.status = SubmissionStatus::Pending;
        }

        self.ledger
            .append(
                "gate-manager",
                EntityKind::Submission,
                submission.id.as_str(),
                "submission_evaluated",
                serde_json::json!({
                    "gate_id": submission.gate_id,
                    "policy": gate.policy,
                    "confidence": submission.confidence,
                    "status": submission.status,
                }),
                None,
            )
            .await?;
        self.persist(&submission).await?;

        debug!(
            submission = %submission.id,
            confidence = submission.confidence,
            status = ?submission.status,
            "submission evaluated"
        );
        Ok(submission.status)
    }

    /// Finalize a pending submission. Approved and rejected are
    /// absorbing; deciding an already-final submission is an error.
    pub async fn decide(
        &self,
        submission_id: &SubmissionId,
        decider: &AgentId,
        approve: bool,
        reason: Option<String>,
    ) -> GateResult<Submission> {
        let handle = self.submission_handle(submission_id).await?;
        let mut submission = handle.lock().await;

        if submission.status != SubmissionStatus::Pending {
            return Err(GateError::InvalidState(format!(
                "submission {} is {}, only pending submissions can be decided",
                submission.id,
                status_name(submission.status)
            )));
        }

        self.ledger
            .append(
                decider.as_str(),
                EntityKind::Submission,
                submission.id.as_str(),
                "submission_decided",
                serde_json::json!({
                    "approved": approve,
                    "reason": reason,
                }),
                None,
            )
            .await?;

        submission.status = if approve {
            SubmissionStatus::Approved
        } else {
            SubmissionStatus::Rejected
        };
        submission.decided_at = Some(Utc::now());
        submission.decided_by = Some(decider.as_str().to_string());
        submission.decision_reason = reason;
        self.persist(&submission).await?;
        Ok(submission.clone())
    }

    pub async fn get_submission(&self, submission_id: &SubmissionId) -> GateResult<Submission> {
        let handle = self.submission_handle(submission_id).await?;
        let submission = handle.lock().await;
        Ok(submission.clone())
    }

    /// All submissions against one step, newest first.
    pub async fn submissions_for_step(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
    ) -> Vec<Submission> {
        let handles: Vec<_> = {
            let submissions = self.submissions.read().await;
            submissions.values().cloned().collect()
        };
        let mut matching = Vec::new();
        for handle in handles {
            let submission = handle.lock().await;
            if &submission.molecule_id == molecule_id && &submission.step_id == step_id {
                matching.push(submission.clone());
            }
        }
        matching.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        matching
    }

    /// Whether some submission against this gate and step is
    /// approved; the only way a gate step completes.
    pub async fn has_approved_submission(
        &self,
        gate_id: &GateId,
        molecule_id: &MoleculeId,
        step_id: &StepId,
    ) -> bool {
        self.submissions_for_step(molecule_id, step_id)
            .await
            .iter()
            .any(|s| &s.gate_id == gate_id && s.status == SubmissionStatus::Approved)
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn submission_handle(
        &self,
        submission_id: &SubmissionId,
    ) -> GateResult<Arc<Mutex<Submission>>> {
        self.submissions
            .read()
            .await
            .get(submission_id)
            .cloned()
            .ok_or_else(|| GateError::SubmissionNotFound(submission_id.clone()))
    }

    async fn persist(&self, submission: &Submission) -> GateResult<()> {
        let body = serde_json::to_value(submission).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::Submission, submission.id.as_str(), body)
            .await?;
        Ok(())
    }
}

// ── Evaluation helpers ───────────────────────────────────────────────

fn run_checks(criteria: &[Criterion], artifacts: &BTreeMap<String, String>) -> Vec<CriterionResult> {
    criteria
        .iter()
        .map(|criterion| {
            let (auto_checked, passed) = match &criterion.auto_check {
                Some(expression) => (true, check::evaluate(expression, artifacts)),
                None => (false, false),
            };
            CriterionResult {
                criterion_id: criterion.id.clone(),
                required: criterion.required,
                auto_checked,
                passed,
            }
        })
        .collect()
}

/// confidence = satisfied weight / total weight, where required
/// criteria weigh 1.0 and optional criteria 0.5. Only auto-checked
/// passes count toward the numerator.
fn compute_confidence(criteria: &[Criterion], results: &[CriterionResult]) -> f64 {
    let total: f64 = criteria
        .iter()
        .map(|c| if c.required { 1.0 } else { 0.5 })
        .sum();
    if total == 0.0 {
        return 0.0;
    }
    let satisfied: f64 = results
        .iter()
        .filter(|r| r.auto_checked && r.passed)
        .map(|r| if r.required { 1.0 } else { 0.5 })
        .sum();
    satisfied / total
}

fn strict_approves(results: &[CriterionResult]) -> bool {
    let required: Vec<_> = results.iter().filter(|r| r.required).collect();
    !required.is_empty() && required.iter().all(|r| r.auto_checked && r.passed)
}

fn auto_checks_only_approves(results: &[CriterionResult]) -> bool {
    let no_required_without_check = results.iter().all(|r| !r.required || r.auto_checked);
    let all_checks_passed = results.iter().filter(|r| r.auto_checked).all(|r| r.passed);
    let has_any_check = results.iter().any(|r| r.auto_checked);
    no_required_without_check && all_checks_passed && has_any_check
}

fn status_name(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Pending => "pending",
        SubmissionStatus::Evaluating => "evaluating",
        SubmissionStatus::Approved => "approved",
        SubmissionStatus::Rejected => "rejected",
    }
}
