//! The assembly point and caller facade
//!
//! Everything is wired here, once, at startup: components take their
//! collaborators as constructor parameters and there is no global
//! registry. [`Core`] is the cheap-to-clone bundle the executor,
//! monitor, and agent behaviors share; [`Guild`] adds the outward
//! facade used by CLIs and dashboards.

use crate::collaborators::Collaborators;
use crate::config::RuntimeConfig;
use crate::executor::{CycleReport, Executor};
use crate::monitor::{HealthAlert, MetricsSnapshot, Monitor};
use crate::{RuntimeError, RuntimeResult};
use chrono::Duration;
use guild_channels::{ChannelKind, ChannelRouter};
use guild_contracts::{Contract, ContractManager, ContractSpec, ValidationReport};
use guild_gates::{Gate, GateManager, Submission, SubmissionStatus};
use guild_hooks::{FailDisposition, HookManager, WorkItem};
use guild_ledger::{FsLedgerStorage, Ledger, MemoryLedgerStorage};
use guild_molecule::{engine::{FailOutcome, ReadySteps}, Molecule, MoleculeEngine, MoleculeSpec, Step};
use guild_org::OrgRegistry;
use guild_scheduler::{ScheduleOutcome, WorkScheduler};
use guild_storage::{FsRecordStore, MemoryRecordStore, RecordStore};
use guild_types::{
    AgentId, AgentProfile, CancelToken, ContractId, FailureKind, MoleculeId, MoleculeStatus,
    OwnerId, Priority, StepId, SubmissionId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The shared component bundle.
#[derive(Clone)]
pub struct Core {
    pub config: RuntimeConfig,
    pub ledger: Arc<Ledger>,
    pub store: Arc<dyn RecordStore>,
    pub org: Arc<OrgRegistry>,
    pub hooks: Arc<HookManager>,
    pub channels: Arc<ChannelRouter>,
    pub gates: Arc<GateManager>,
    pub contracts: Arc<ContractManager>,
    pub engine: Arc<MoleculeEngine>,
    pub scheduler: Arc<WorkScheduler>,
    pub collaborators: Collaborators,
}

impl Core {
    /// Turn a ready step into a schedulable work item. The
    /// molecule's estimated cost doubles as the per-attempt estimate
    /// the cost cap is checked against.
    pub fn work_item_for(&self, molecule: &Molecule, step: &Step) -> WorkItem {
        let mut item = WorkItem::new(
            molecule.id.clone(),
            step.id.clone(),
            step.priority,
            step.name.clone(),
        );
        item.required_capabilities = step.required_capabilities.clone();
        item.max_retries = step.max_retries;
        item.estimated_cost = molecule.economics.estimated_cost;
        item
    }

    /// Hand newly ready steps to the scheduler (or directly to the
    /// declared assignee's hook). Returns how many were placed.
    pub async fn seed_steps(&self, ready: ReadySteps) -> RuntimeResult<usize> {
        let mut placed = 0;
        for (molecule_id, step) in ready {
            let molecule = self.engine.get(&molecule_id).await?;
            let item = self.work_item_for(&molecule, &step);
            match &step.assignee {
                Some(owner) => {
                    self.hooks.enqueue(owner, item).await?;
                    placed += 1;
                }
                None => {
                    if let ScheduleOutcome::Assigned(_) =
                        self.scheduler.schedule(item, None).await?
                    {
                        placed += 1;
                    }
                }
            }
        }
        Ok(placed)
    }

    /// Complete a claimed item and its step, then seed whatever
    /// became ready (including replacement-phase steps when a
    /// persistent-retry loop exhausted on this very attempt). Feeds
    /// the learning sink with the molecule's outcome and escalates
    /// upchain on failure.
    pub async fn finish_work_item(
        &self,
        owner: &OwnerId,
        item: &WorkItem,
        result: serde_json::Value,
    ) -> RuntimeResult<usize> {
        self.hooks.complete(owner, &item.id, result.clone()).await?;
        let ready = self
            .engine
            .complete_step(&item.molecule_id, &item.step_id, result)
            .await?;
        let placed = self.seed_steps(ready).await?;

        let molecule = self.engine.get(&item.molecule_id).await?;
        match molecule.status {
            MoleculeStatus::Completed => {
                self.collaborators.learning.on_molecule_completed(&molecule).await;
            }
            MoleculeStatus::Failed => {
                self.collaborators
                    .learning
                    .on_molecule_failed(&molecule, "retry loop exhausted")
                    .await;
                self.escalate_upchain(
                    &item.molecule_id,
                    format!("molecule '{}' failed: retry loop exhausted", molecule.name),
                )
                .await?;
            }
            _ => {}
        }
        Ok(placed)
    }

    /// Fail a claimed item. Requeued items release their step back to
    /// ready; an exhausted item fails the step (and possibly the
    /// molecule, which escalates upchain).
    pub async fn fail_work_item(
        &self,
        owner: &OwnerId,
        item: &WorkItem,
        error: &str,
        retryable: bool,
        failure_kind: FailureKind,
    ) -> RuntimeResult<()> {
        match self.hooks.fail(owner, &item.id, error, retryable).await? {
            FailDisposition::Requeued(_) => {
                self.engine
                    .release_step(&item.molecule_id, &item.step_id)
                    .await?;
            }
            FailDisposition::Exhausted(item) => {
                self.fail_step_with_escalation(
                    &item.molecule_id,
                    &item.step_id,
                    error,
                    failure_kind,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Engine-level step failure plus the automatic upchain
    /// escalation and learning notification on molecule failure. Any
    /// replacement-phase steps escalation produced are seeded.
    pub async fn fail_step_with_escalation(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        error: &str,
        failure_kind: FailureKind,
    ) -> RuntimeResult<FailOutcome> {
        let outcome = self
            .engine
            .fail_step(molecule_id, step_id, error, failure_kind)
            .await?;
        if let FailOutcome::MoleculeFailed { follow_up } = &outcome {
            self.seed_steps(follow_up.clone()).await?;
            let molecule = self.engine.get(molecule_id).await?;
            self.collaborators
                .learning
                .on_molecule_failed(&molecule, error)
                .await;
            self.escalate_upchain(
                molecule_id,
                format!("molecule '{}' failed: {error}", molecule.name),
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Send an escalation message upchain from the molecule's
    /// accountable agent to their superior.
    pub async fn escalate_upchain(
        &self,
        molecule_id: &MoleculeId,
        detail: String,
    ) -> RuntimeResult<()> {
        let molecule = self.engine.get(molecule_id).await?;
        let accountable = molecule.raci.accountable.clone();
        let superior = match self.org.get(&accountable).await {
            Ok(profile) => profile.reports_to,
            Err(_) => None,
        };
        match superior {
            Some(superior) => {
                self.channels
                    .send(
                        &accountable,
                        ChannelKind::Upchain,
                        &[superior],
                        format!("escalation: {}", molecule.name),
                        detail,
                        Priority::P1,
                        None,
                    )
                    .await?;
            }
            None => {
                warn!(molecule = %molecule_id, "escalation had no superior to route to");
            }
        }
        Ok(())
    }

    /// A molecule's accountable gate is satisfied once every gate
    /// step has completed through an approved submission.
    pub fn accountable_gate_satisfied(&self, molecule: &Molecule) -> bool {
        molecule
            .steps
            .iter()
            .filter(|s| s.is_gate)
            .all(|s| s.status == guild_types::StepStatus::Completed)
    }
}

/// The assembled orchestration core.
pub struct Guild {
    core: Core,
    executor: Executor,
    monitor: Monitor,
}

impl Guild {
    /// Assemble every subsystem. With `config.data_root` set, state
    /// persists under that directory in the documented layout;
    /// without it, everything stays in memory.
    pub async fn open(config: RuntimeConfig, collaborators: Collaborators) -> RuntimeResult<Self> {
        let (ledger, store) = match &config.data_root {
            Some(root) => {
                let ledger_storage = FsLedgerStorage::open(root.join("ledger"))?;
                let ledger = Arc::new(Ledger::open(Box::new(ledger_storage))?);
                let store: Arc<dyn RecordStore> = Arc::new(FsRecordStore::open(root)?);
                (ledger, store)
            }
            None => {
                let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new()))?);
                let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
                (ledger, store)
            }
        };

        let org = Arc::new(OrgRegistry::open(ledger.clone(), store.clone()).await?);
        let hooks = Arc::new(HookManager::new(
            ledger.clone(),
            store.clone(),
            Duration::seconds(config.stale_claim_secs),
        ));
        hooks.load().await?;
        let channels =
            Arc::new(ChannelRouter::open(ledger.clone(), store.clone(), org.clone()).await?);
        let gates = Arc::new(GateManager::open(ledger.clone(), store.clone()).await?);
        let contracts = Arc::new(ContractManager::open(ledger.clone(), store.clone()).await?);
        let engine =
            Arc::new(MoleculeEngine::open(ledger.clone(), store.clone(), gates.clone()).await?);
        let scheduler = Arc::new(WorkScheduler::new(
            ledger.clone(),
            org.clone(),
            hooks.clone(),
            engine.clone(),
            config.park_unmatched,
        ));

        let core = Core {
            config,
            ledger,
            store,
            org,
            hooks,
            channels,
            gates,
            contracts,
            engine,
            scheduler,
            collaborators,
        };
        let executor = Executor::new(core.clone());
        let monitor = Monitor::new(core.clone());
        info!("guild assembled");
        Ok(Self {
            core,
            executor,
            monitor,
        })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    // ── Agents ───────────────────────────────────────────────────────

    /// Hire an agent: org registration, a fresh hook, and a retry of
    /// any parked assignments the newcomer might satisfy.
    pub async fn hire_agent(&self, profile: AgentProfile) -> RuntimeResult<()> {
        let agent_id = profile.id.clone();
        let owner_kind = profile.tier.into();
        self.core.org.hire(profile).await?;
        self.core
            .hooks
            .create_hook((&agent_id).into(), owner_kind)
            .await?;
        self.core.scheduler.register_agent(&agent_id).await?;
        Ok(())
    }

    // ── Molecules ────────────────────────────────────────────────────

    pub async fn create_molecule(&self, spec: MoleculeSpec) -> RuntimeResult<Molecule> {
        Ok(self.core.engine.create(spec).await?)
    }

    /// Start a molecule and seed its ready steps into the scheduler.
    /// Returns the number of placed work items.
    pub async fn start_molecule(&self, molecule_id: &MoleculeId) -> RuntimeResult<usize> {
        let ready = self.core.engine.start(molecule_id).await?;
        self.core.seed_steps(ready).await
    }

    pub async fn advance_molecule(&self, molecule_id: &MoleculeId) -> RuntimeResult<usize> {
        let ready = self.core.engine.advance(molecule_id).await?;
        self.core.seed_steps(ready).await
    }

    pub async fn list_molecules(&self, status: Option<MoleculeStatus>) -> Vec<Molecule> {
        self.core.engine.list(status).await
    }

    pub async fn get_molecule(&self, molecule_id: &MoleculeId) -> RuntimeResult<Molecule> {
        Ok(self.core.engine.get(molecule_id).await?)
    }

    // ── Gates ────────────────────────────────────────────────────────

    pub async fn list_gates(&self) -> Vec<Gate> {
        self.core.gates.list_gates().await
    }

    pub async fn get_submission(&self, submission_id: &SubmissionId) -> RuntimeResult<Submission> {
        Ok(self.core.gates.get_submission(submission_id).await?)
    }

    /// Submit artifacts for a gate step. Auto-approved submissions
    /// complete the step immediately and seed downstream work.
    pub async fn submit_to_gate(
        &self,
        molecule_id: &MoleculeId,
        step_id: &StepId,
        submitter: &AgentId,
        artifacts: BTreeMap<String, String>,
    ) -> RuntimeResult<Submission> {
        let molecule = self.core.engine.get(molecule_id).await?;
        let step = molecule
            .step(step_id)
            .ok_or_else(|| RuntimeError::InvalidState(format!("no step {step_id}")))?;
        let gate_id = step
            .gate_id
            .clone()
            .ok_or_else(|| RuntimeError::InvalidState(format!("step {step_id} is not gated")))?;

        let submission = self
            .core
            .gates
            .submit(&gate_id, molecule_id, step_id, submitter, artifacts)
            .await?;

        if submission.status == SubmissionStatus::Approved {
            let ready = self
                .core
                .engine
                .complete_gate_step(molecule_id, step_id, &submission.id)
                .await?;
            self.core.seed_steps(ready).await?;
        }
        Ok(submission)
    }

    /// Decide a pending submission. Approval completes the gate step;
    /// rejection fails the step through the normal retry path, so a
    /// step with budget left returns to ready for a new submission.
    pub async fn decide_submission(
        &self,
        submission_id: &SubmissionId,
        decider: &AgentId,
        approve: bool,
        reason: Option<String>,
    ) -> RuntimeResult<Submission> {
        let submission = self
            .core
            .gates
            .decide(submission_id, decider, approve, reason.clone())
            .await?;

        if approve {
            let ready = self
                .core
                .engine
                .complete_gate_step(
                    &submission.molecule_id,
                    &submission.step_id,
                    &submission.id,
                )
                .await?;
            self.core.seed_steps(ready).await?;
        } else {
            let detail = reason.unwrap_or_else(|| "submission rejected".to_string());
            let outcome = self
                .core
                .fail_step_with_escalation(
                    &submission.molecule_id,
                    &submission.step_id,
                    &detail,
                    FailureKind::LogicError,
                )
                .await?;
            if let FailOutcome::Retrying { .. } = outcome {
                // The gate step is ready again, awaiting resubmission.
                let ready = self.core.engine.advance(&submission.molecule_id).await?;
                self.core.seed_steps(ready).await?;
            }
        }
        Ok(submission)
    }

    // ── Contracts ────────────────────────────────────────────────────

    /// Create a molecule's contract and link the pair.
    pub async fn create_contract(
        &self,
        molecule_id: &MoleculeId,
        spec: ContractSpec,
    ) -> RuntimeResult<Contract> {
        let contract = self.core.contracts.create(molecule_id, spec).await?;
        self.core
            .engine
            .attach_contract(molecule_id, &contract.id)
            .await?;
        Ok(contract)
    }

    pub async fn activate_contract(&self, contract_id: &ContractId) -> RuntimeResult<Contract> {
        let contract = self.core.contracts.get(contract_id).await?;
        let molecule = self.core.engine.get(&contract.molecule_id).await?;
        Ok(self
            .core
            .contracts
            .activate(contract_id, molecule.status)
            .await?)
    }

    pub async fn get_contract(&self, contract_id: &ContractId) -> RuntimeResult<Contract> {
        Ok(self.core.contracts.get(contract_id).await?)
    }

    /// Check off a contract criterion. When every required criterion
    /// is met and the molecule's gate steps are all approved, the
    /// contract completes.
    pub async fn check_criterion(
        &self,
        contract_id: &ContractId,
        index: usize,
        verifier: &AgentId,
    ) -> RuntimeResult<Contract> {
        let all_met = self
            .core
            .contracts
            .check(contract_id, index, verifier.as_str())
            .await?;
        if all_met {
            let contract = self.core.contracts.get(contract_id).await?;
            let molecule = self.core.engine.get(&contract.molecule_id).await?;
            if self.core.accountable_gate_satisfied(&molecule) {
                return Ok(self.core.contracts.complete(contract_id).await?);
            }
        }
        Ok(self.core.contracts.get(contract_id).await?)
    }

    /// Run a continuous contract's validation pass; threshold
    /// crossings escalate upchain automatically.
    pub async fn validate_contract(
        &self,
        contract_id: &ContractId,
        context: &BTreeMap<String, String>,
    ) -> RuntimeResult<ValidationReport> {
        let report = self
            .core
            .contracts
            .validate_continuous(contract_id, context)
            .await?;
        if let Some(signal) = &report.escalation {
            self.core
                .escalate_upchain(&signal.molecule_id, signal.detail.clone())
                .await?;
        }
        Ok(report)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub async fn collect_metrics(&self) -> RuntimeResult<MetricsSnapshot> {
        self.monitor.collect_metrics().await
    }

    pub async fn list_alerts(&self) -> RuntimeResult<Vec<HealthAlert>> {
        self.monitor.check_health().await
    }

    // ── Driving ──────────────────────────────────────────────────────

    pub async fn run_cycle(&self, cancel: &CancelToken) -> RuntimeResult<CycleReport> {
        self.executor.run_cycle(cancel).await
    }

    pub async fn run_continuous(&self, cancel: CancelToken) -> RuntimeResult<()> {
        let interval = std::time::Duration::from_secs(self.core.config.cycle_interval_secs);
        self.executor.run_continuous(interval, cancel).await
    }
}
