//! The contract manager
//!
//! Creation, activation, criterion check-off, amendment, and
//! continuous validation. Amendments never mutate in place: each one
//! produces a new contract record, and the molecule's contract index
//! always points at the latest version.

use crate::contract::{
    evaluate_check, ContinuousCriterion, Contract, ContractStatus, EscalationSignal,
    SuccessCriterion, ValidationMode, ValidationReport,
};
use crate::{ContractError, ContractResult};
use chrono::Utc;
use guild_ledger::{EntityKind, Ledger};
use guild_storage::{RecordKind, RecordStore};
use guild_types::{ContractId, MoleculeId, MoleculeStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct ContractState {
    contracts: HashMap<ContractId, Contract>,
    /// molecule → latest contract version.
    by_molecule: HashMap<MoleculeId, ContractId>,
}

/// Manager of success contracts.
pub struct ContractManager {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    state: RwLock<ContractState>,
}

/// Everything needed to create a contract besides the molecule link.
#[derive(Clone, Debug, Default)]
pub struct ContractSpec {
    pub objective: String,
    pub success_criteria: Vec<SuccessCriterion>,
    pub in_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub constraints: Vec<String>,
    pub validation_mode: ValidationMode,
    pub continuous_criteria: Vec<ContinuousCriterion>,
    pub escalation_threshold: u32,
}

impl ContractManager {
    pub async fn open(ledger: Arc<Ledger>, store: Arc<dyn RecordStore>) -> ContractResult<Self> {
        let mut contracts = HashMap::new();
        let mut by_molecule: HashMap<MoleculeId, ContractId> = HashMap::new();

        for (_, body) in store.list(RecordKind::Contract).await? {
            let contract: Contract =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            // Only non-amended versions index by molecule.
            if contract.status != ContractStatus::Amended {
                by_molecule.insert(contract.molecule_id.clone(), contract.id.clone());
            }
            contracts.insert(contract.id.clone(), contract);
        }

        Ok(Self {
            ledger,
            store,
            state: RwLock::new(ContractState {
                contracts,
                by_molecule,
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Create version 1 of a molecule's contract. A molecule carries
    /// at most one contract.
    pub async fn create(
        &self,
        molecule_id: &MoleculeId,
        spec: ContractSpec,
    ) -> ContractResult<Contract> {
        let mut state = self.state.write().await;
        if state.by_molecule.contains_key(molecule_id) {
            return Err(ContractError::InvalidState(format!(
                "molecule {molecule_id} already has a contract"
            )));
        }

        let threshold = if spec.escalation_threshold == 0 {
            3
        } else {
            spec.escalation_threshold
        };
        let contract = Contract {
            id: ContractId::generate(),
            molecule_id: molecule_id.clone(),
            version: 1,
            status: ContractStatus::Draft,
            objective: spec.objective,
            success_criteria: spec.success_criteria,
            in_scope: spec.in_scope,
            out_of_scope: spec.out_of_scope,
            constraints: spec.constraints,
            validation_mode: spec.validation_mode,
            continuous_criteria: spec.continuous_criteria,
            consecutive_failures: 0,
            escalation_threshold: threshold,
            previous_version: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        self.ledger
            .append(
                "contract-manager",
                EntityKind::Contract,
                contract.id.as_str(),
                "contract_created",
                serde_json::json!({
                    "molecule_id": molecule_id,
                    "version": contract.version,
                    "objective": contract.objective,
                }),
                None,
            )
            .await?;
        self.persist(&contract).await?;

        state
            .by_molecule
            .insert(molecule_id.clone(), contract.id.clone());
        state.contracts.insert(contract.id.clone(), contract.clone());
        info!(contract = %contract.id, molecule = %molecule_id, "contract created");
        Ok(contract)
    }

    /// Activate a draft contract. The caller supplies the molecule's
    /// current status; activation is legal only while the molecule is
    /// draft or active.
    pub async fn activate(
        &self,
        contract_id: &ContractId,
        molecule_status: MoleculeStatus,
    ) -> ContractResult<Contract> {
        if !matches!(molecule_status, MoleculeStatus::Draft | MoleculeStatus::Active) {
            return Err(ContractError::InvalidState(format!(
                "cannot activate a contract while its molecule is {molecule_status}"
            )));
        }

        let mut state = self.state.write().await;
        let contract = state
            .contracts
            .get(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
        if contract.status != ContractStatus::Draft {
            return Err(ContractError::InvalidState(format!(
                "contract {contract_id} is not a draft"
            )));
        }

        self.ledger
            .append(
                "contract-manager",
                EntityKind::Contract,
                contract_id.as_str(),
                "contract_activated",
                serde_json::json!({ "version": contract.version }),
                None,
            )
            .await?;

        let contract = state
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
        contract.status = ContractStatus::Active;
        let snapshot = contract.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Mark one success criterion as met. Returns true when all
    /// required criteria are now met (the runtime then completes the
    /// contract once the molecule's accountable gate is satisfied).
    pub async fn check(
        &self,
        contract_id: &ContractId,
        index: usize,
        verifier: impl Into<String>,
    ) -> ContractResult<bool> {
        let verifier = verifier.into();
        let mut state = self.state.write().await;
        let contract = state
            .contracts
            .get(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;

        if contract.status != ContractStatus::Active {
            return Err(ContractError::InvalidState(format!(
                "contract {contract_id} is not active"
            )));
        }
        if index >= contract.success_criteria.len() {
            return Err(ContractError::CriterionOutOfRange(index));
        }

        self.ledger
            .append(
                verifier.as_str(),
                EntityKind::Contract,
                contract_id.as_str(),
                "contract_criterion_met",
                serde_json::json!({
                    "index": index,
                    "description": contract.success_criteria[index].description,
                }),
                None,
            )
            .await?;

        let contract = state
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
        let criterion = &mut contract.success_criteria[index];
        if !criterion.met {
            criterion.met = true;
            criterion.verified_by = Some(verifier);
            criterion.verified_at = Some(Utc::now());
        }
        let all_met = contract.all_required_met();
        let snapshot = contract.clone();
        self.persist(&snapshot).await?;
        Ok(all_met)
    }

    /// Complete an active contract whose required criteria are met.
    pub async fn complete(&self, contract_id: &ContractId) -> ContractResult<Contract> {
        self.finish(contract_id, ContractStatus::Completed, "contract_completed")
            .await
    }

    /// Fail an active contract.
    pub async fn fail(&self, contract_id: &ContractId) -> ContractResult<Contract> {
        self.finish(contract_id, ContractStatus::Failed, "contract_failed")
            .await
    }

    /// Amend a contract: the current version becomes `amended` and a
    /// new version (with the provided spec) takes its place as the
    /// molecule's contract.
    pub async fn amend(
        &self,
        contract_id: &ContractId,
        spec: ContractSpec,
    ) -> ContractResult<Contract> {
        let mut state = self.state.write().await;
        let previous = state
            .contracts
            .get(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?
            .clone();

        if matches!(
            previous.status,
            ContractStatus::Completed | ContractStatus::Failed | ContractStatus::Amended
        ) {
            return Err(ContractError::InvalidState(format!(
                "contract {contract_id} can no longer be amended"
            )));
        }

        let next = Contract {
            id: ContractId::generate(),
            molecule_id: previous.molecule_id.clone(),
            version: previous.version + 1,
            status: previous.status,
            objective: spec.objective,
            success_criteria: spec.success_criteria,
            in_scope: spec.in_scope,
            out_of_scope: spec.out_of_scope,
            constraints: spec.constraints,
            validation_mode: spec.validation_mode,
            continuous_criteria: spec.continuous_criteria,
            consecutive_failures: 0,
            escalation_threshold: if spec.escalation_threshold == 0 {
                previous.escalation_threshold
            } else {
                spec.escalation_threshold
            },
            previous_version: Some(previous.id.clone()),
            created_at: Utc::now(),
            completed_at: None,
        };

        self.ledger
            .append(
                "contract-manager",
                EntityKind::Contract,
                next.id.as_str(),
                "contract_amended",
                serde_json::json!({
                    "previous": previous.id,
                    "version": next.version,
                }),
                None,
            )
            .await?;

        // Retire the previous version, then persist both records.
        let retired = {
            let previous = state
                .contracts
                .get_mut(contract_id)
                .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
            previous.status = ContractStatus::Amended;
            previous.clone()
        };
        self.persist(&retired).await?;
        self.persist(&next).await?;

        state
            .by_molecule
            .insert(next.molecule_id.clone(), next.id.clone());
        state.contracts.insert(next.id.clone(), next.clone());
        info!(contract = %next.id, version = next.version, "contract amended");
        Ok(next)
    }

    // ── Continuous validation ────────────────────────────────────────

    /// Run every continuous criterion against the supplied context.
    /// Failures accumulate; a run of `escalation_threshold`
    /// consecutive failing passes yields an escalation signal.
    pub async fn validate_continuous(
        &self,
        contract_id: &ContractId,
        context: &BTreeMap<String, String>,
    ) -> ContractResult<ValidationReport> {
        let mut state = self.state.write().await;
        let contract = state
            .contracts
            .get(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;

        if contract.validation_mode == ValidationMode::OneTime {
            return Err(ContractError::InvalidState(
                "contract is not continuously validated".to_string(),
            ));
        }
        if contract.status != ContractStatus::Active {
            return Err(ContractError::InvalidState(format!(
                "contract {contract_id} is not active"
            )));
        }

        let failures: Vec<String> = contract
            .continuous_criteria
            .iter()
            .filter(|criterion| !evaluate_check(&criterion.check, context))
            .map(|criterion| criterion.description.clone())
            .collect();
        let passed = failures.is_empty();

        let consecutive_failures = if passed {
            0
        } else {
            contract.consecutive_failures + 1
        };
        let threshold = contract.escalation_threshold;
        let escalate = !passed && consecutive_failures >= threshold;

        self.ledger
            .append(
                "contract-manager",
                EntityKind::Contract,
                contract_id.as_str(),
                "contract_validated",
                serde_json::json!({
                    "passed": passed,
                    "failures": failures,
                    "consecutive_failures": consecutive_failures,
                }),
                None,
            )
            .await?;

        let molecule_id = contract.molecule_id.clone();
        let contract = state
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
        contract.consecutive_failures = consecutive_failures;
        let snapshot = contract.clone();
        self.persist(&snapshot).await?;

        let escalation = if escalate {
            warn!(
                contract = %contract_id,
                consecutive_failures,
                "continuous contract crossed its escalation threshold"
            );
            Some(EscalationSignal {
                contract_id: contract_id.clone(),
                molecule_id,
                consecutive_failures,
                detail: format!(
                    "{consecutive_failures} consecutive validation failures: {}",
                    failures.join("; ")
                ),
            })
        } else {
            None
        };

        Ok(ValidationReport {
            passed,
            failures,
            consecutive_failures,
            escalation,
        })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get(&self, contract_id: &ContractId) -> ContractResult<Contract> {
        self.state
            .read()
            .await
            .contracts
            .get(contract_id)
            .cloned()
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))
    }

    /// The latest contract version for a molecule, if one exists.
    pub async fn for_molecule(&self, molecule_id: &MoleculeId) -> Option<Contract> {
        let state = self.state.read().await;
        state
            .by_molecule
            .get(molecule_id)
            .and_then(|id| state.contracts.get(id))
            .cloned()
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn finish(
        &self,
        contract_id: &ContractId,
        status: ContractStatus,
        event: &str,
    ) -> ContractResult<Contract> {
        let mut state = self.state.write().await;
        let contract = state
            .contracts
            .get(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;

        if contract.status != ContractStatus::Active {
            return Err(ContractError::InvalidState(format!(
                "contract {contract_id} is not active"
            )));
        }
        if status == ContractStatus::Completed && !contract.all_required_met() {
            return Err(ContractError::InvalidState(
                "required criteria are not all met".to_string(),
            ));
        }

        self.ledger
            .append(
                "contract-manager",
                EntityKind::Contract,
                contract_id.as_str(),
                event,
                serde_json::json!({ "version": contract.version }),
                None,
            )
            .await?;

        let contract = state
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound(contract_id.clone()))?;
        contract.status = status;
        contract.completed_at = Some(Utc::now());
        let snapshot = contract.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    async fn persist(&self, contract: &Contract) -> ContractResult<()> {
        let body = serde_json::to_value(contract).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::Contract, contract.id.as_str(), body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guild_ledger::MemoryLedgerStorage;
    use guild_storage::MemoryRecordStore;

    async fn make_manager() -> ContractManager {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store = Arc::new(MemoryRecordStore::new());
        ContractManager::open(ledger, store).await.unwrap()
    }

    fn basic_spec() -> ContractSpec {
        ContractSpec {
            objective: "ship the feature".to_string(),
            success_criteria: vec![
                SuccessCriterion::required("implemented"),
                SuccessCriterion::required("tested"),
                SuccessCriterion::optional("documented"),
            ],
            escalation_threshold: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_contract_per_molecule() {
        let manager = make_manager().await;
        let molecule = MoleculeId::new("m1");
        manager.create(&molecule, basic_spec()).await.unwrap();
        let result = manager.create(&molecule, basic_spec()).await;
        assert!(matches!(result, Err(ContractError::InvalidState(_))));
    }

    #[tokio::test]
    async fn activation_requires_a_live_molecule() {
        let manager = make_manager().await;
        let contract = manager.create(&MoleculeId::new("m1"), basic_spec()).await.unwrap();

        let result = manager.activate(&contract.id, MoleculeStatus::Failed).await;
        assert!(matches!(result, Err(ContractError::InvalidState(_))));

        let activated = manager
            .activate(&contract.id, MoleculeStatus::Active)
            .await
            .unwrap();
        assert_eq!(activated.status, ContractStatus::Active);
    }

    #[tokio::test]
    async fn check_reports_when_required_criteria_are_done() {
        let manager = make_manager().await;
        let contract = manager.create(&MoleculeId::new("m1"), basic_spec()).await.unwrap();
        manager
            .activate(&contract.id, MoleculeStatus::Active)
            .await
            .unwrap();

        assert!(!manager.check(&contract.id, 0, "vp-eng").await.unwrap());
        // Optional criterion does not matter.
        assert!(manager.check(&contract.id, 1, "vp-eng").await.unwrap());

        let contract = manager.get(&contract.id).await.unwrap();
        assert_eq!(
            contract.success_criteria[0].verified_by.as_deref(),
            Some("vp-eng")
        );
        assert!(contract.success_criteria[0].verified_at.is_some());
    }

    #[tokio::test]
    async fn check_is_idempotent_per_criterion() {
        let manager = make_manager().await;
        let contract = manager.create(&MoleculeId::new("m1"), basic_spec()).await.unwrap();
        manager
            .activate(&contract.id, MoleculeStatus::Active)
            .await
            .unwrap();

        manager.check(&contract.id, 0, "first").await.unwrap();
        manager.check(&contract.id, 0, "second").await.unwrap();

        let contract = manager.get(&contract.id).await.unwrap();
        assert_eq!(
            contract.success_criteria[0].verified_by.as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn completion_needs_required_criteria() {
        let manager = make_manager().await;
        let contract = manager.create(&MoleculeId::new("m1"), basic_spec()).await.unwrap();
        manager
            .activate(&contract.id, MoleculeStatus::Active)
            .await
            .unwrap();

        assert!(matches!(
            manager.complete(&contract.id).await,
            Err(ContractError::InvalidState(_))
        ));

        manager.check(&contract.id, 0, "vp").await.unwrap();
        manager.check(&contract.id, 1, "vp").await.unwrap();
        let completed = manager.complete(&contract.id).await.unwrap();
        assert_eq!(completed.status, ContractStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn amendment_creates_a_new_version() {
        let manager = make_manager().await;
        let molecule = MoleculeId::new("m1");
        let v1 = manager.create(&molecule, basic_spec()).await.unwrap();
        manager.activate(&v1.id, MoleculeStatus::Active).await.unwrap();

        let mut spec = basic_spec();
        spec.objective = "ship the feature, plus telemetry".to_string();
        let v2 = manager.amend(&v1.id, spec).await.unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.previous_version, Some(v1.id.clone()));
        assert_eq!(v2.status, ContractStatus::Active);

        // The old version is retained, immutable, and no longer the
        // molecule's contract.
        let old = manager.get(&v1.id).await.unwrap();
        assert_eq!(old.status, ContractStatus::Amended);
        let latest = manager.for_molecule(&molecule).await.unwrap();
        assert_eq!(latest.id, v2.id);

        // Amended versions cannot be amended again.
        assert!(matches!(
            manager.amend(&v1.id, basic_spec()).await,
            Err(ContractError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn continuous_validation_escalates_after_threshold() {
        let manager = make_manager().await;
        let spec = ContractSpec {
            objective: "keep the service healthy".to_string(),
            success_criteria: vec![SuccessCriterion::required("quarter passes")],
            validation_mode: ValidationMode::Continuous,
            continuous_criteria: vec![ContinuousCriterion {
                description: "uptime holds".to_string(),
                check: "context:uptime=ok".to_string(),
            }],
            escalation_threshold: 2,
            ..Default::default()
        };
        let contract = manager.create(&MoleculeId::new("m1"), spec).await.unwrap();
        manager
            .activate(&contract.id, MoleculeStatus::Active)
            .await
            .unwrap();

        let bad: BTreeMap<String, String> =
            [("uptime".to_string(), "degraded".to_string())].into();
        let good: BTreeMap<String, String> = [("uptime".to_string(), "ok".to_string())].into();

        let report = manager.validate_continuous(&contract.id, &bad).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.consecutive_failures, 1);
        assert!(report.escalation.is_none());

        let report = manager.validate_continuous(&contract.id, &bad).await.unwrap();
        assert_eq!(report.consecutive_failures, 2);
        let signal = report.escalation.expect("threshold crossed");
        assert_eq!(signal.consecutive_failures, 2);

        // A passing run resets the streak.
        let report = manager.validate_continuous(&contract.id, &good).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn contracts_reload_after_restart() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
        let molecule = MoleculeId::new("m1");
        let id;
        {
            let manager = ContractManager::open(ledger.clone(), store.clone()).await.unwrap();
            let contract = manager.create(&molecule, basic_spec()).await.unwrap();
            id = contract.id;
        }
        let manager = ContractManager::open(ledger, store).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().version, 1);
        assert_eq!(manager.for_molecule(&molecule).await.unwrap().id, id);
    }
}
