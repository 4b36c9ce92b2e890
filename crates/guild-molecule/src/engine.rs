//! The molecule engine
//!
//! Owns the molecule map and serializes all mutations per molecule
//! behind one lock each. The engine coordinates, it never executes
//! work: steps are completed and failed by the agents driving them,
//! and the engine advances readiness, enforces gates and cost caps,
//! loops persistent and continuous topologies, and walks composite
//! phases (including failure escalation).
//!
//! Lock discipline: a molecule's own lock is always taken before the
//! engine consults the molecule map for another id, and parent locks
//! are only taken after the child's lock has been released. That
//! keeps phase transitions atomic with respect to child lookups
//! without lock-order cycles.

use crate::molecule::{Economics, Molecule, SwarmStepSets};
use crate::spec::{MoleculeSpec, StepSpec};
use crate::step::{Checkpoint, Step};
use crate::topology::{
    exit_criterion_met, CompositeConfig, PhaseFailureAction, PhaseSpec, SwarmConfig,
    TopologyConfig,
};
use crate::{MoleculeError, MoleculeResult};
use chrono::Utc;
use guild_gates::GateManager;
use guild_ledger::{EntityKind, Ledger};
use guild_storage::{RecordKind, RecordStore};
use guild_types::{
    FailureBead, FailureKind, MoleculeId, MoleculeStatus, StepId, StepStatus, SubmissionId,
    WorkflowKind,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Steps that became ready, tagged with the molecule they belong to
/// (composite advancement surfaces steps of child molecules).
pub type ReadySteps = Vec<(MoleculeId, Step)>;

/// What happened to a failed step.
#[derive(Clone, Debug)]
pub enum FailOutcome {
    /// The step went back to ready for another attempt.
    Retrying { retry_count: u32 },
    /// The step and its molecule failed permanently. When the failed
    /// molecule was a composite phase, escalation may have started a
    /// replacement phase whose ready steps still need scheduling.
    MoleculeFailed { follow_up: ReadySteps },
    /// Persistent-retry only: an exit criterion was already satisfied,
    /// so the loop ended (successfully) despite the failed attempt.
    ExitSatisfied,
}

/// The workflow engine.
pub struct MoleculeEngine {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    gates: Arc<GateManager>,
    molecules: RwLock<HashMap<MoleculeId, Arc<Mutex<Molecule>>>>,
}

impl MoleculeEngine {
    /// Open the engine, reloading persisted molecules.
    pub async fn open(
        ledger: Arc<Ledger>,
        store: Arc<dyn RecordStore>,
        gates: Arc<GateManager>,
    ) -> MoleculeResult<Self> {
        let mut molecules = HashMap::new();
        for kind in [RecordKind::MoleculeActive, RecordKind::MoleculeCompleted] {
            for (_, body) in store.list(kind).await? {
                let molecule: Molecule =
                    serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
                molecules.insert(molecule.id.clone(), Arc::new(Mutex::new(molecule)));
            }
        }
        info!(loaded = molecules.len(), "molecule engine opened");
        Ok(Self {
            ledger,
            store,
            gates,
            molecules: RwLock::new(molecules),
        })
    }

    // ── Creation and templates ───────────────────────────────────────

    /// Create a molecule from a spec. Status starts at `draft`.
    pub async fn create(&self, spec: MoleculeSpec) -> MoleculeResult<Molecule> {
        let molecule = build_molecule(&spec, None)?;

        self.ledger
            .append(
                molecule.creator.as_str(),
                EntityKind::Molecule,
                molecule.id.as_str(),
                "molecule_created",
                json!({
                    "name": molecule.name,
                    "kind": molecule.kind,
                    "accountable": molecule.raci.accountable,
                    "steps": molecule.steps.len(),
                }),
                None,
            )
            .await?;
        self.persist(&molecule).await?;

        let mut molecules = self.molecules.write().await;
        molecules.insert(molecule.id.clone(), Arc::new(Mutex::new(molecule.clone())));
        info!(molecule = %molecule.id, name = %molecule.name, "molecule created");
        Ok(molecule)
    }

    /// Record the molecule's contract. Molecules and contracts pair
    /// 1:1; re-attaching is refused.
    pub async fn attach_contract(
        &self,
        molecule_id: &MoleculeId,
        contract_id: &guild_types::ContractId,
    ) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        if molecule.contract_id.is_some() {
            return Err(MoleculeError::InvalidState(format!(
                "molecule {molecule_id} already has a contract"
            )));
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule_id.as_str(),
                "contract_attached",
                json!({ "contract_id": contract_id }),
                None,
            )
            .await?;
        molecule.contract_id = Some(contract_id.clone());
        self.persist(&molecule).await?;
        Ok(())
    }

    /// Persist a spec as a reusable template. Returns the template id.
    pub async fn save_template(&self, spec: &MoleculeSpec) -> MoleculeResult<String> {
        let template_id = format!("tpl-{}", uuid::Uuid::new_v4());
        let body = serde_json::to_value(spec).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::MoleculeTemplate, &template_id, body)
            .await?;
        Ok(template_id)
    }

    /// Load a template spec; `create` then mints fresh ids from it.
    pub async fn load_template(&self, template_id: &str) -> MoleculeResult<MoleculeSpec> {
        let body = self
            .store
            .get(RecordKind::MoleculeTemplate, template_id)
            .await?
            .ok_or_else(|| MoleculeError::InvalidState(format!("no template {template_id}")))?;
        Ok(serde_json::from_value(body).map_err(guild_storage::StorageError::from)?)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start a molecule: expand its topology into concrete steps,
    /// validate the dependency DAG, and return the steps that are
    /// ready for scheduling.
    pub async fn start(&self, molecule_id: &MoleculeId) -> MoleculeResult<ReadySteps> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;

        if !matches!(molecule.status, MoleculeStatus::Draft | MoleculeStatus::Pending) {
            return Err(MoleculeError::InvalidState(format!(
                "molecule {molecule_id} is {}, not startable",
                molecule.status
            )));
        }

        expand_on_start(&mut molecule)?;
        molecule.validate_dag()?;

        self.ledger
            .append(
                molecule.creator.as_str(),
                EntityKind::Molecule,
                molecule_id.as_str(),
                "molecule_started",
                json!({ "kind": molecule.kind }),
                None,
            )
            .await?;

        molecule.status = MoleculeStatus::Active;
        let newly_ready = molecule.recompute_readiness();
        let mut ready: ReadySteps = steps_of(&molecule, newly_ready);

        // A composite's schedulable work lives in its first phase.
        if molecule.kind == WorkflowKind::Composite {
            let phase_ready = self.start_phase(&mut molecule, 0, None).await?;
            ready.extend(phase_ready);
        }

        self.persist(&molecule).await?;
        Ok(ready)
    }

    /// Re-evaluate readiness and completion. Called after any
    /// dependency change.
    pub async fn advance(&self, molecule_id: &MoleculeId) -> MoleculeResult<ReadySteps> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        let (ready, parent_event) = self.after_step_change(&mut molecule).await?;
        drop(molecule);
        self.propagate(parent_event, ready).await
    }

    /// Mark a ready step as in progress (its work item was claimed).
    pub async fn mark_step_in_progress(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
    ) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        let step = molecule
            .step_mut(step_id)
            .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
        if step.status != StepStatus::Ready {
            return Err(MoleculeError::InvalidState(format!(
                "step {step_id} is not ready"
            )));
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_started",
                json!({ "molecule_id": molecule_id }),
                None,
            )
            .await?;

        if let Some(step) = molecule.step_mut(step_id) {
            step.status = StepStatus::InProgress;
        }
        self.persist(&molecule).await?;
        Ok(())
    }

    /// Return an in-progress step to ready without spending a retry.
    /// This is the release path for cancellations and stale-claim
    /// reclaims; the work item goes back to queued, and so does the
    /// step.
    pub async fn release_step(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
    ) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        let step = molecule
            .step(step_id)
            .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
        if step.status != StepStatus::InProgress {
            return Ok(());
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_released",
                json!({ "molecule_id": molecule_id }),
                None,
            )
            .await?;
        if let Some(step) = molecule.step_mut(step_id) {
            step.status = StepStatus::Ready;
        }
        self.persist(&molecule).await?;
        Ok(())
    }

    /// Complete a step with its result. Refuses gate steps: those
    /// complete only through [`MoleculeEngine::complete_gate_step`].
    pub async fn complete_step(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        result: serde_json::Value,
    ) -> MoleculeResult<ReadySteps> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        self.ensure_active(&molecule)?;

        {
            let step = molecule
                .step(step_id)
                .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
            if step.is_gate {
                return Err(MoleculeError::InvalidState(format!(
                    "step {step_id} is a gate; it completes through an approved submission"
                )));
            }
            if !matches!(step.status, StepStatus::Ready | StepStatus::InProgress) {
                return Err(MoleculeError::InvalidState(format!(
                    "step {step_id} is not running"
                )));
            }
        }

        // A persistent-retry attempt only exits the loop when an exit
        // criterion is satisfied (or none were declared).
        if molecule.kind == WorkflowKind::PersistentRetry
            && !self.retry_attempt_may_exit(&molecule)
        {
            return self
                .continue_retry_loop(molecule, step_id, "attempt finished without meeting exit criteria")
                .await;
        }

        self.finish_step(&mut molecule, step_id, result).await?;
        let (ready, parent_event) = self.after_step_change(&mut molecule).await?;
        drop(molecule);
        self.propagate(parent_event, ready).await
    }

    /// Complete a gate step through an approved submission.
    pub async fn complete_gate_step(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        submission_id: &SubmissionId,
    ) -> MoleculeResult<ReadySteps> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        self.ensure_active(&molecule)?;

        let gate_id = {
            let step = molecule
                .step(step_id)
                .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
            if !step.is_gate {
                return Err(MoleculeError::InvalidState(format!(
                    "step {step_id} is not a gate step"
                )));
            }
            if step.is_terminal() {
                return Err(MoleculeError::InvalidState(format!(
                    "gate step {step_id} is already settled"
                )));
            }
            step.gate_id.clone().ok_or_else(|| {
                MoleculeError::InvalidState(format!("gate step {step_id} has no gate id"))
            })?
        };

        let submission = self.gates.get_submission(submission_id).await?;
        if submission.gate_id != gate_id
            || &submission.step_id != step_id
            || &submission.molecule_id != molecule_id
        {
            return Err(MoleculeError::InvalidState(format!(
                "submission {submission_id} does not target gate step {step_id}"
            )));
        }
        if !self
            .gates
            .has_approved_submission(&gate_id, molecule_id, step_id)
            .await
        {
            return Err(MoleculeError::InvalidState(format!(
                "gate step {step_id} has no approved submission"
            )));
        }

        self.finish_step(
            &mut molecule,
            step_id,
            json!({ "approved_submission": submission_id }),
        )
        .await?;
        let (ready, parent_event) = self.after_step_change(&mut molecule).await?;
        drop(molecule);
        self.propagate(parent_event, ready).await
    }

    /// Fail a step. Remaining retry budget resets the step to ready
    /// (with the failure appended to its checkpoints as context for
    /// the next attempt); an exhausted budget fails the molecule.
    pub async fn fail_step(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        error: &str,
        failure_kind: FailureKind,
    ) -> MoleculeResult<FailOutcome> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        self.ensure_active(&molecule)?;

        {
            let step = molecule
                .step_mut(step_id)
                .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
            step.retry_count += 1;
            step.failures.push(FailureBead::new(failure_kind, error));
            step.add_checkpoint(Checkpoint::new(
                "attempt failed",
                json!({ "error": error, "attempt": step.retry_count }),
            ));
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_attempt_failed",
                json!({
                    "molecule_id": molecule_id,
                    "error": error,
                    "failure_kind": failure_kind,
                }),
                None,
            )
            .await?;

        // Exit criteria are re-evaluated after every attempt, failed
        // ones included.
        if molecule.kind == WorkflowKind::PersistentRetry && self.retry_exit_satisfied(&molecule) {
            self.finish_step(&mut molecule, step_id, json!({ "exited_after_failure": true }))
                .await?;
            let (_, parent_event) = self.after_step_change(&mut molecule).await?;
            drop(molecule);
            self.propagate(parent_event, Vec::new()).await?;
            return Ok(FailOutcome::ExitSatisfied);
        }

        let (exhausted, retry_count) = {
            let step = molecule
                .step(step_id)
                .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
            (step.retry_count > step.max_retries, step.retry_count)
        };

        if exhausted {
            if let Some(step) = molecule.step_mut(step_id) {
                step.status = StepStatus::Failed;
            }
            self.ledger
                .append(
                    "molecule-engine",
                    EntityKind::Step,
                    step_id.as_str(),
                    "step_failed",
                    json!({ "molecule_id": molecule_id, "retries": retry_count - 1 }),
                    None,
                )
                .await?;
            let parent_event = self
                .fail_molecule_locked(&mut molecule, &format!("step {step_id} exhausted retries"))
                .await?;
            drop(molecule);
            let follow_up = self.propagate(parent_event, Vec::new()).await?;
            return Ok(FailOutcome::MoleculeFailed { follow_up });
        }

        if let Some(step) = molecule.step_mut(step_id) {
            step.status = StepStatus::Ready;
        }
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_retried",
                json!({ "molecule_id": molecule_id, "retry_count": retry_count }),
                None,
            )
            .await?;
        self.persist(&molecule).await?;
        Ok(FailOutcome::Retrying { retry_count })
    }

    /// Append a checkpoint to a step. Append-only: recording the same
    /// checkpoint twice appends two entries and corrupts nothing.
    pub async fn checkpoint(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        description: impl Into<String>,
        data: serde_json::Value,
    ) -> MoleculeResult<()> {
        let description = description.into();
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;

        if molecule.step(step_id).is_none() {
            return Err(MoleculeError::StepNotFound(step_id.clone()));
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "checkpoint_recorded",
                json!({ "molecule_id": molecule_id, "description": description }),
                None,
            )
            .await?;

        if let Some(step) = molecule.step_mut(step_id) {
            step.add_checkpoint(Checkpoint::new(description, data));
        }
        self.persist(&molecule).await?;
        Ok(())
    }

    /// Admit one more attempt under the molecule's cost cap. An
    /// attempt that would push spend past the cap is rejected and the
    /// molecule fails.
    pub async fn begin_attempt(
        &self,
        molecule_id: &MoleculeId,
        estimated_cost: f64,
    ) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;
        self.ensure_active(&molecule)?;

        if molecule.over_cost_cap(estimated_cost) {
            let spent = molecule.economics.actual_cost;
            let cap = molecule.cost_cap.unwrap_or(0.0);
            self.ledger
                .append(
                    "molecule-engine",
                    EntityKind::Molecule,
                    molecule_id.as_str(),
                    "cost_cap_exceeded",
                    json!({ "spent": spent, "cap": cap, "attempt_cost": estimated_cost }),
                    None,
                )
                .await?;
            let parent_event = self
                .fail_molecule_locked(&mut molecule, "cost cap exceeded")
                .await?;
            drop(molecule);
            self.propagate(parent_event, Vec::new()).await?;
            return Err(MoleculeError::CostCapExceeded { spent, cap });
        }
        Ok(())
    }

    /// Record the actual cost of an attempt. Spend past the cap
    /// forces the molecule to fail.
    pub async fn record_attempt_cost(
        &self,
        molecule_id: &MoleculeId,
        cost: f64,
    ) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule_id.as_str(),
                "cost_recorded",
                json!({ "cost": cost }),
                None,
            )
            .await?;
        molecule.add_cost(cost);

        if molecule.over_cost_cap(0.0) {
            let spent = molecule.economics.actual_cost;
            let cap = molecule.cost_cap.unwrap_or(0.0);
            self.ledger
                .append(
                    "molecule-engine",
                    EntityKind::Molecule,
                    molecule_id.as_str(),
                    "cost_cap_exceeded",
                    json!({ "spent": spent, "cap": cap }),
                    None,
                )
                .await?;
            let parent_event = self
                .fail_molecule_locked(&mut molecule, "cost cap exceeded")
                .await?;
            drop(molecule);
            self.propagate(parent_event, Vec::new()).await?;
            return Err(MoleculeError::CostCapExceeded { spent, cap });
        }

        self.persist(&molecule).await?;
        Ok(())
    }

    /// Set a context value that exit criteria evaluate against.
    pub async fn set_context(
        &self,
        molecule_id: &MoleculeId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> MoleculeResult<()> {
        let key = key.into();
        let value = value.into();
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule_id.as_str(),
                "context_updated",
                json!({ "key": key }),
                None,
            )
            .await?;
        molecule.context.insert(key, value);
        self.persist(&molecule).await?;
        Ok(())
    }

    pub async fn pause(&self, molecule_id: &MoleculeId) -> MoleculeResult<()> {
        self.set_paused(molecule_id, true).await
    }

    pub async fn resume(&self, molecule_id: &MoleculeId) -> MoleculeResult<()> {
        self.set_paused(molecule_id, false).await
    }

    /// Apply a composite phase's failure action after a child
    /// molecule failed.
    pub async fn handle_phase_failure(
        &self,
        composite_id: &MoleculeId,
        child_id: &MoleculeId,
        reason: &str,
    ) -> MoleculeResult<ReadySteps> {
        let mut current = (composite_id.clone(), child_id.clone(), reason.to_string());
        loop {
            let (composite_id, child_id, reason) = current;
            let handle = self.handle(&composite_id).await?;
            let mut molecule = handle.lock().await;

            if molecule.active_child.as_ref() != Some(&child_id) {
                return Err(MoleculeError::InvalidState(format!(
                    "{child_id} is not the active phase of {composite_id}"
                )));
            }

            let config = composite_config(&molecule)?.clone();
            let phase_index = molecule.current_phase;
            let phase = config.phases.get(phase_index).cloned().ok_or_else(|| {
                MoleculeError::InvalidState(format!("composite {composite_id} has no phase {phase_index}"))
            })?;

            self.ledger
                .append(
                    "molecule-engine",
                    EntityKind::Molecule,
                    composite_id.as_str(),
                    "phase_failed",
                    json!({
                        "phase": phase_index,
                        "child": child_id,
                        "action": phase.on_failure,
                        "reason": reason,
                    }),
                    None,
                )
                .await?;

            let outcome = match phase.on_failure {
                PhaseFailureAction::Fail => None,
                PhaseFailureAction::Retry => {
                    let attempts = {
                        let slot = molecule
                            .phase_attempts
                            .get_mut(phase_index)
                            .ok_or_else(|| {
                                MoleculeError::InvalidState("phase attempts not initialized".into())
                            })?;
                        *slot += 1;
                        *slot
                    };
                    if attempts >= phase.max_failures {
                        None
                    } else {
                        Some(self.start_phase(&mut molecule, phase_index, None).await?)
                    }
                }
                PhaseFailureAction::EscalateToPrevious => {
                    molecule.escalation_count += 1;
                    if molecule.escalation_count >= config.max_escalations {
                        None
                    } else {
                        let previous = phase_index.saturating_sub(1);
                        molecule.current_phase = previous;
                        Some(self.start_phase(&mut molecule, previous, None).await?)
                    }
                }
                PhaseFailureAction::EscalateToSwarm => {
                    molecule.escalation_count += 1;
                    if molecule.escalation_count >= config.max_escalations {
                        None
                    } else {
                        let research = research_phase(&reason);
                        insert_phase(&mut molecule, phase_index, research)?;
                        let objective =
                            format!("Additional research needed after failure: {reason}");
                        Some(
                            self.start_phase(&mut molecule, phase_index, Some(objective))
                                .await?,
                        )
                    }
                }
            };

            match outcome {
                Some(ready) => {
                    self.persist(&molecule).await?;
                    return Ok(ready);
                }
                None => {
                    let parent_event = self
                        .fail_molecule_locked(
                            &mut molecule,
                            &format!("phase {phase_index} failed: {reason}"),
                        )
                        .await?;
                    drop(molecule);
                    match parent_event {
                        Some(ParentEvent::ChildFailed { parent, child, reason }) => {
                            current = (parent, child, reason);
                        }
                        _ => return Ok(Vec::new()),
                    }
                }
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get(&self, molecule_id: &MoleculeId) -> MoleculeResult<Molecule> {
        let handle = self.handle(molecule_id).await?;
        let molecule = handle.lock().await;
        Ok(molecule.clone())
    }

    pub async fn list(&self, status: Option<MoleculeStatus>) -> Vec<Molecule> {
        let handles: Vec<_> = {
            let molecules = self.molecules.read().await;
            molecules.values().cloned().collect()
        };
        let mut listed = Vec::new();
        for handle in handles {
            let molecule = handle.lock().await;
            if status.is_none() || status == Some(molecule.status) {
                listed.push(molecule.clone());
            }
        }
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        listed
    }

    /// Progress in [0, 1]; composite progress folds in the active
    /// child's own progress.
    pub async fn progress(&self, molecule_id: &MoleculeId) -> MoleculeResult<f64> {
        // Walk down the active-child chain without holding two locks
        // at once.
        let mut chain: Vec<(usize, usize)> = Vec::new(); // (phases, current)
        let mut current = molecule_id.clone();
        loop {
            let handle = self.handle(&current).await?;
            let molecule = handle.lock().await;
            if molecule.kind == WorkflowKind::Composite {
                let phases = composite_config(&molecule)?.phases.len().max(1);
                if molecule.status == MoleculeStatus::Completed {
                    chain.push((phases, phases));
                    drop(molecule);
                    return Ok(fold_chain(chain, 1.0));
                }
                chain.push((phases, molecule.current_phase));
                match &molecule.active_child {
                    Some(child) => {
                        let child = child.clone();
                        drop(molecule);
                        current = child;
                    }
                    None => {
                        drop(molecule);
                        return Ok(fold_chain(chain, 0.0));
                    }
                }
            } else {
                let leaf = molecule.progress();
                drop(molecule);
                return Ok(fold_chain(chain, leaf));
            }
        }
    }

    // ── Internal: completion machinery ───────────────────────────────

    async fn finish_step(
        &self,
        molecule: &mut Molecule,
        step_id: &StepId,
        result: serde_json::Value,
    ) -> MoleculeResult<()> {
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_completed",
                json!({ "molecule_id": molecule.id, "result": result }),
                None,
            )
            .await?;
        if let Some(step) = molecule.step_mut(step_id) {
            step.status = StepStatus::Completed;
            step.metadata.insert("result".to_string(), result);
        }
        Ok(())
    }

    /// Readiness recomputation plus molecule-level completion.
    /// Returns newly ready steps and, when the molecule reached a
    /// terminal state and has a composite parent, the event to
    /// propagate after the lock drops.
    async fn after_step_change(
        &self,
        molecule: &mut Molecule,
    ) -> MoleculeResult<(ReadySteps, Option<ParentEvent>)> {
        let newly_ready = molecule.recompute_readiness();
        let mut ready = steps_of(molecule, newly_ready);

        let mut parent_event = None;
        if molecule.status == MoleculeStatus::Active && molecule.all_steps_terminal() {
            if molecule.any_step_failed() {
                parent_event = self.fail_molecule_locked(molecule, "a step failed").await?;
            } else if let Some(loop_config) = molecule.topology.loop_config().cloned() {
                let exit = loop_config
                    .exit_criteria
                    .iter()
                    .any(|criterion| exit_criterion_met(criterion, &molecule.context))
                    || loop_config
                        .max_iterations
                        .map(|max| molecule.current_iteration + 1 >= max)
                        .unwrap_or(false);
                if exit {
                    parent_event = self.complete_molecule_locked(molecule).await?;
                } else {
                    molecule.current_iteration += 1;
                    self.ledger
                        .append(
                            "molecule-engine",
                            EntityKind::Molecule,
                            molecule.id.as_str(),
                            "iteration_started",
                            json!({ "iteration": molecule.current_iteration }),
                            None,
                        )
                        .await?;
                    for step in &mut molecule.steps {
                        step.status = StepStatus::Pending;
                    }
                    let next_iteration = molecule.recompute_readiness();
                    ready.extend(steps_of(molecule, next_iteration));
                }
            } else {
                parent_event = self.complete_molecule_locked(molecule).await?;
            }
        }

        self.persist(molecule).await?;
        Ok((ready, parent_event))
    }

    async fn complete_molecule_locked(
        &self,
        molecule: &mut Molecule,
    ) -> MoleculeResult<Option<ParentEvent>> {
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule.id.as_str(),
                "molecule_completed",
                json!({ "progress": molecule.progress() }),
                None,
            )
            .await?;
        molecule.status = MoleculeStatus::Completed;
        molecule.completed_at = Some(Utc::now());
        info!(molecule = %molecule.id, "molecule completed");

        Ok(molecule.parent.clone().map(|parent| ParentEvent::ChildCompleted {
            parent,
            child: molecule.id.clone(),
        }))
    }

    async fn fail_molecule_locked(
        &self,
        molecule: &mut Molecule,
        reason: &str,
    ) -> MoleculeResult<Option<ParentEvent>> {
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule.id.as_str(),
                "molecule_failed",
                json!({ "reason": reason }),
                None,
            )
            .await?;
        molecule.status = MoleculeStatus::Failed;
        molecule.completed_at = Some(Utc::now());
        self.persist(molecule).await?;
        warn!(molecule = %molecule.id, reason, "molecule failed");

        Ok(molecule.parent.clone().map(|parent| ParentEvent::ChildFailed {
            parent,
            child: molecule.id.clone(),
            reason: reason.to_string(),
        }))
    }

    /// Deliver a terminal child's event to its composite parent.
    async fn propagate(
        &self,
        event: Option<ParentEvent>,
        mut ready: ReadySteps,
    ) -> MoleculeResult<ReadySteps> {
        let mut next = event;
        while let Some(event) = next.take() {
            match event {
                ParentEvent::ChildFailed { parent, child, reason } => {
                    let phase_ready = self.handle_phase_failure(&parent, &child, &reason).await?;
                    ready.extend(phase_ready);
                }
                ParentEvent::ChildCompleted { parent, child } => {
                    let (phase_ready, follow_up) = self.advance_phase(&parent, &child).await?;
                    ready.extend(phase_ready);
                    next = follow_up;
                }
            }
        }
        Ok(ready)
    }

    /// Move a composite to its next phase after the active child
    /// completed. Returns ready steps plus a completion event for the
    /// grandparent when the whole composite finished.
    async fn advance_phase(
        &self,
        composite_id: &MoleculeId,
        child_id: &MoleculeId,
    ) -> MoleculeResult<(ReadySteps, Option<ParentEvent>)> {
        let handle = self.handle(composite_id).await?;
        let mut molecule = handle.lock().await;

        if molecule.active_child.as_ref() != Some(child_id) {
            return Err(MoleculeError::InvalidState(format!(
                "{child_id} is not the active phase of {composite_id}"
            )));
        }

        let phase_count = composite_config(&molecule)?.phases.len();
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                composite_id.as_str(),
                "phase_completed",
                json!({ "phase": molecule.current_phase, "child": child_id }),
                None,
            )
            .await?;

        molecule.active_child = None;
        molecule.current_phase += 1;

        if molecule.current_phase >= phase_count {
            let parent_event = self.complete_molecule_locked(&mut molecule).await?;
            self.persist(&molecule).await?;
            return Ok((Vec::new(), parent_event));
        }

        let phase_index = molecule.current_phase;
        let ready = self.start_phase(&mut molecule, phase_index, None).await?;
        self.persist(&molecule).await?;
        Ok((ready, None))
    }

    /// Materialize one composite phase as a child molecule and start
    /// it. The parent lock is held throughout, which is what makes
    /// phase transitions atomic with respect to child lookups.
    async fn start_phase(
        &self,
        parent: &mut Molecule,
        phase_index: usize,
        objective: Option<String>,
    ) -> MoleculeResult<ReadySteps> {
        let config = composite_config(parent)?;
        let phase = config.phases.get(phase_index).cloned().ok_or_else(|| {
            MoleculeError::InvalidState(format!("no phase {phase_index} to start"))
        })?;

        let mut spec = MoleculeSpec::new(
            format!("{} / phase {}: {}", parent.name, phase_index + 1, phase.name),
            parent.creator.clone(),
            parent.raci.accountable.clone(),
            phase.topology.clone(),
        );
        spec.steps = phase.steps.clone();
        if let Some(objective) = objective {
            spec.description = objective;
        }
        if spec.steps.is_empty()
            && matches!(
                spec.topology,
                TopologyConfig::Linear | TopologyConfig::PersistentRetry(_)
            )
        {
            spec.steps.push(StepSpec::new(phase.name.clone()));
        }

        let mut child = build_molecule(&spec, Some(parent.id.clone()))?;
        expand_on_start(&mut child)?;
        child.validate_dag()?;
        child.status = MoleculeStatus::Active;
        let newly_ready = child.recompute_readiness();
        let ready = steps_of(&child, newly_ready);

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                parent.id.as_str(),
                "phase_started",
                json!({
                    "phase": phase_index,
                    "child": child.id,
                    "name": phase.name,
                }),
                None,
            )
            .await?;
        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                child.id.as_str(),
                "molecule_started",
                json!({ "kind": child.kind, "parent": parent.id }),
                None,
            )
            .await?;

        self.persist(&child).await?;
        parent.children.push(child.id.clone());
        parent.active_child = Some(child.id.clone());

        let mut molecules = self.molecules.write().await;
        molecules.insert(child.id.clone(), Arc::new(Mutex::new(child)));
        debug!(parent = %parent.id, phase = phase_index, "composite phase started");
        Ok(ready)
    }

    // ── Internal: persistent-retry helpers ───────────────────────────

    fn retry_exit_satisfied(&self, molecule: &Molecule) -> bool {
        match &molecule.topology {
            TopologyConfig::PersistentRetry(config) => config
                .exit_criteria
                .iter()
                .any(|criterion| exit_criterion_met(criterion, &molecule.context)),
            _ => false,
        }
    }

    /// Whether a successful attempt may leave the retry loop: either
    /// no exit criteria were declared, or one of them is satisfied.
    fn retry_attempt_may_exit(&self, molecule: &Molecule) -> bool {
        match &molecule.topology {
            TopologyConfig::PersistentRetry(config) => {
                config.exit_criteria.is_empty() || self.retry_exit_satisfied(molecule)
            }
            _ => true,
        }
    }

    /// A persistent-retry attempt ended without satisfying any exit
    /// criterion: spend a retry and reset the step, or fail out.
    async fn continue_retry_loop(
        &self,
        mut molecule: tokio::sync::MutexGuard<'_, Molecule>,
        step_id: &StepId,
        note: &str,
    ) -> MoleculeResult<ReadySteps> {
        let (exhausted, retry_count) = {
            let step = molecule
                .step_mut(step_id)
                .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
            step.retry_count += 1;
            step.add_checkpoint(Checkpoint::new(note, json!({ "attempt": step.retry_count })));
            (step.retry_count > step.max_retries, step.retry_count)
        };

        if exhausted {
            if let Some(step) = molecule.step_mut(step_id) {
                step.status = StepStatus::Failed;
            }
            self.ledger
                .append(
                    "molecule-engine",
                    EntityKind::Step,
                    step_id.as_str(),
                    "step_failed",
                    json!({ "molecule_id": molecule.id, "reason": "retry loop exhausted" }),
                    None,
                )
                .await?;
            let parent_event = self
                .fail_molecule_locked(&mut molecule, "retry loop exhausted without exit")
                .await?;
            drop(molecule);
            // Escalation may have produced a replacement phase; its
            // ready steps flow back to the caller for scheduling.
            return self.propagate(parent_event, Vec::new()).await;
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Step,
                step_id.as_str(),
                "step_retried",
                json!({ "molecule_id": molecule.id, "retry_count": retry_count, "note": note }),
                None,
            )
            .await?;
        let step = molecule
            .step_mut(step_id)
            .ok_or_else(|| MoleculeError::StepNotFound(step_id.clone()))?;
        step.status = StepStatus::Ready;
        let ready = steps_of(&molecule, vec![step_id.clone()]);
        self.persist(&molecule).await?;
        Ok(ready)
    }

    // ── Internal: small helpers ──────────────────────────────────────

    async fn handle(&self, molecule_id: &MoleculeId) -> MoleculeResult<Arc<Mutex<Molecule>>> {
        self.molecules
            .read()
            .await
            .get(molecule_id)
            .cloned()
            .ok_or_else(|| MoleculeError::NotFound(molecule_id.clone()))
    }

    fn ensure_active(&self, molecule: &Molecule) -> MoleculeResult<()> {
        if molecule.status != MoleculeStatus::Active {
            return Err(MoleculeError::InvalidState(format!(
                "molecule {} is {}",
                molecule.id, molecule.status
            )));
        }
        Ok(())
    }

    async fn set_paused(&self, molecule_id: &MoleculeId, paused: bool) -> MoleculeResult<()> {
        let handle = self.handle(molecule_id).await?;
        let mut molecule = handle.lock().await;

        let (from, to, event) = if paused {
            (MoleculeStatus::Active, MoleculeStatus::Paused, "molecule_paused")
        } else {
            (MoleculeStatus::Paused, MoleculeStatus::Active, "molecule_resumed")
        };
        if molecule.status != from {
            return Err(MoleculeError::InvalidState(format!(
                "molecule {molecule_id} is {}",
                molecule.status
            )));
        }

        self.ledger
            .append(
                "molecule-engine",
                EntityKind::Molecule,
                molecule_id.as_str(),
                event,
                json!({}),
                None,
            )
            .await?;
        molecule.status = to;
        self.persist(&molecule).await?;
        Ok(())
    }

    async fn persist(&self, molecule: &Molecule) -> MoleculeResult<()> {
        let body = serde_json::to_value(molecule).map_err(guild_storage::StorageError::from)?;
        if molecule.status.is_terminal() {
            self.store
                .put(RecordKind::MoleculeCompleted, molecule.id.as_str(), body)
                .await?;
            self.store
                .remove(RecordKind::MoleculeActive, molecule.id.as_str())
                .await?;
        } else {
            self.store
                .put(RecordKind::MoleculeActive, molecule.id.as_str(), body)
                .await?;
        }
        Ok(())
    }
}

/// Event a terminal child delivers to its composite parent.
enum ParentEvent {
    ChildCompleted {
        parent: MoleculeId,
        child: MoleculeId,
    },
    ChildFailed {
        parent: MoleculeId,
        child: MoleculeId,
        reason: String,
    },
}

// ── Construction and expansion ───────────────────────────────────────

fn build_molecule(spec: &MoleculeSpec, parent: Option<MoleculeId>) -> MoleculeResult<Molecule> {
    let mut names: HashMap<&str, StepId> = HashMap::new();
    let mut steps = Vec::with_capacity(spec.steps.len());
    for step_spec in &spec.steps {
        if names.contains_key(step_spec.name.as_str()) {
            return Err(MoleculeError::InvalidState(format!(
                "duplicate step name '{}'",
                step_spec.name
            )));
        }
        let step = step_spec.build();
        names.insert(step_spec.name.as_str(), step.id.clone());
        steps.push(step);
    }
    for (step, step_spec) in steps.iter_mut().zip(&spec.steps) {
        for dep_name in &step_spec.depends_on {
            let dep_id = names.get(dep_name.as_str()).ok_or_else(|| {
                MoleculeError::InvalidState(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, dep_name
                ))
            })?;
            step.depends_on.push(dep_id.clone());
        }
    }

    Ok(Molecule {
        id: MoleculeId::generate(),
        name: spec.name.clone(),
        description: spec.description.clone(),
        status: MoleculeStatus::Draft,
        kind: spec.topology.kind(),
        topology: spec.topology.clone(),
        creator: spec.creator.clone(),
        raci: spec.raci.clone(),
        steps,
        economics: Economics {
            estimated_cost: spec.estimated_cost,
            estimated_value: spec.estimated_value,
            actual_cost: 0.0,
            confidence: None,
        },
        cost_cap: spec.cost_cap,
        children: Vec::new(),
        parent,
        contract_id: None,
        current_phase: 0,
        escalation_count: 0,
        phase_attempts: Vec::new(),
        active_child: None,
        current_iteration: 0,
        swarm_steps: None,
        context: BTreeMap::new(),
        created_at: Utc::now(),
        completed_at: None,
    })
}

/// Topology-specific expansion at start time.
fn expand_on_start(molecule: &mut Molecule) -> MoleculeResult<()> {
    match molecule.topology.clone() {
        TopologyConfig::Swarm(config) => expand_swarm(molecule, &config),
        TopologyConfig::PersistentRetry(config) => {
            if molecule.steps.len() != 1 {
                return Err(MoleculeError::InvalidState(format!(
                    "persistent-retry molecules wrap exactly one step, found {}",
                    molecule.steps.len()
                )));
            }
            molecule.steps[0].max_retries = config.max_retries;
            if molecule.cost_cap.is_none() {
                molecule.cost_cap = config.cost_cap;
            }
            Ok(())
        }
        TopologyConfig::Composite(config) => {
            if config.phases.is_empty() {
                return Err(MoleculeError::InvalidState(
                    "composite molecules need at least one phase".to_string(),
                ));
            }
            if !molecule.steps.is_empty() {
                return Err(MoleculeError::InvalidState(
                    "composite molecules define steps per phase, not at the top level".to_string(),
                ));
            }
            molecule.phase_attempts = vec![0; config.phases.len()];
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Expand a swarm into scatter, critique, and convergence steps.
fn expand_swarm(molecule: &mut Molecule, config: &SwarmConfig) -> MoleculeResult<()> {
    if config.scatter_count < 2 {
        return Err(MoleculeError::InvalidState(
            "swarm scatter_count must be at least 2".to_string(),
        ));
    }
    if !molecule.steps.is_empty() {
        return Err(MoleculeError::InvalidState(
            "swarm steps are generated; do not declare steps".to_string(),
        ));
    }

    let capability = config.required_capability.clone();
    let make = |name: String| {
        let mut step = Step::new(name);
        if let Some(capability) = &capability {
            step.required_capabilities.insert(capability.clone());
        }
        step
    };

    let mut scatter = Vec::with_capacity(config.scatter_count);
    for i in 0..config.scatter_count {
        let step = make(format!("scatter-{}", i + 1));
        scatter.push(step.id.clone());
        molecule.steps.push(step);
    }

    // Round 0 critiques the matching scatter output; every later
    // round reads all of the previous round.
    let mut critique_rounds: Vec<Vec<StepId>> = Vec::with_capacity(config.critique_rounds);
    for round in 0..config.critique_rounds {
        let mut this_round = Vec::with_capacity(config.scatter_count);
        for i in 0..config.scatter_count {
            let mut step = make(format!("critique-{}-{}", round + 1, i + 1));
            if round == 0 {
                step.depends_on.push(scatter[i].clone());
            } else {
                step.depends_on = critique_rounds[round - 1].clone();
            }
            this_round.push(step.id.clone());
            molecule.steps.push(step);
        }
        critique_rounds.push(this_round);
    }

    let mut converge = make("converge".to_string());
    converge.depends_on = match critique_rounds.last() {
        Some(final_round) => final_round.clone(),
        None => scatter.clone(),
    };
    let converge_id = converge.id.clone();
    molecule.steps.push(converge);

    molecule.swarm_steps = Some(SwarmStepSets {
        scatter,
        critique_rounds,
        converge: converge_id,
    });
    Ok(())
}

fn composite_config(molecule: &Molecule) -> MoleculeResult<&CompositeConfig> {
    match &molecule.topology {
        TopologyConfig::Composite(config) => Ok(config),
        _ => Err(MoleculeError::InvalidState(format!(
            "molecule {} is not composite",
            molecule.id
        ))),
    }
}

/// Insert a synthetic phase (escalation research) before `index`.
fn insert_phase(molecule: &mut Molecule, index: usize, phase: PhaseSpec) -> MoleculeResult<()> {
    match &mut molecule.topology {
        TopologyConfig::Composite(config) => {
            config.phases.insert(index, phase);
            molecule.phase_attempts.insert(index, 0);
            Ok(())
        }
        _ => Err(MoleculeError::InvalidState(format!(
            "molecule {} is not composite",
            molecule.id
        ))),
    }
}

fn research_phase(reason: &str) -> PhaseSpec {
    PhaseSpec {
        name: format!("research: {reason}"),
        topology: TopologyConfig::Swarm(SwarmConfig {
            scatter_count: 2,
            critique_rounds: 0,
            convergence: crate::topology::ConvergenceStrategy::Synthesize,
            min_agreement: 0.0,
            required_capability: None,
        }),
        steps: Vec::new(),
        on_failure: PhaseFailureAction::Fail,
        max_failures: 1,
    }
}

fn steps_of(molecule: &Molecule, ids: Vec<StepId>) -> ReadySteps {
    ids.into_iter()
        .filter_map(|id| molecule.step(&id).cloned())
        .map(|step| (molecule.id.clone(), step))
        .collect()
}

/// Fold a composite chain's (phase_count, current_phase) frames
/// around the innermost leaf progress.
fn fold_chain(chain: Vec<(usize, usize)>, leaf: f64) -> f64 {
    chain.into_iter().rev().fold(leaf, |inner, (phases, current)| {
        ((current.min(phases)) as f64 + inner) / phases as f64
    })
}
