//! The molecule record
//!
//! Pure state plus the readiness and progress calculations; every
//! mutation that matters goes through the engine, which wraps each
//! molecule in its own lock.

use crate::step::Step;
use crate::topology::TopologyConfig;
use crate::{MoleculeError, MoleculeResult};
use chrono::{DateTime, Utc};
use guild_types::{
    AgentId, ContractId, MoleculeId, MoleculeStatus, RaciAssignments, StepId, StepStatus,
    WorkflowKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Cost and value tracking for a molecule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Economics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default)]
    pub actual_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The generated step-id sets of an expanded swarm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwarmStepSets {
    pub scatter: Vec<StepId>,
    /// One inner vec per critique round.
    pub critique_rounds: Vec<Vec<StepId>>,
    pub converge: StepId,
}

/// A persistent workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Molecule {
    pub id: MoleculeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: MoleculeStatus,
    pub kind: WorkflowKind,
    pub topology: TopologyConfig,
    pub creator: AgentId,
    pub raci: RaciAssignments,
    pub steps: Vec<Step>,
    pub economics: Economics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cap: Option<f64>,
    /// Child molecule ids (composite phases).
    #[serde(default)]
    pub children: Vec<MoleculeId>,
    /// Parent composite, if this molecule is a phase child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<MoleculeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
    /// Composite: index of the running phase.
    #[serde(default)]
    pub current_phase: usize,
    /// Composite: escalations consumed so far.
    #[serde(default)]
    pub escalation_count: u32,
    /// Composite: attempts per phase index.
    #[serde(default)]
    pub phase_attempts: Vec<u32>,
    /// Composite: the child currently executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_child: Option<MoleculeId>,
    /// Continuous/hybrid: completed iteration count.
    #[serde(default)]
    pub current_iteration: u64,
    /// Swarm: the generated step-id sets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm_steps: Option<SwarmStepSets>,
    /// Key-value context that exit criteria evaluate against.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Molecule {
    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| &s.id == step_id)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate that dependencies reference known steps and form a
    /// DAG (Kahn's algorithm).
    pub fn validate_dag(&self) -> MoleculeResult<()> {
        let known: HashSet<&StepId> = self.steps.iter().map(|s| &s.id).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !known.contains(dep) {
                    return Err(MoleculeError::NotADag(format!(
                        "step '{}' depends on unknown step {}",
                        step.name, dep
                    )));
                }
            }
        }

        let mut in_degree: HashMap<&StepId, usize> = self
            .steps
            .iter()
            .map(|s| (&s.id, s.depends_on.len()))
            .collect();
        let mut queue: Vec<&StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(current) = queue.pop() {
            visited += 1;
            for step in &self.steps {
                if step.depends_on.contains(current) {
                    let degree = in_degree.entry(&step.id).or_insert(0);
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push(&step.id);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(MoleculeError::NotADag(format!(
                "{} of {} steps are on a dependency cycle",
                self.steps.len() - visited,
                self.steps.len()
            )));
        }
        Ok(())
    }

    /// Promote pending steps whose dependencies are all satisfied.
    /// Returns the newly ready step ids in declaration order, which
    /// is the order they are handed to the scheduler.
    pub fn recompute_readiness(&mut self) -> Vec<StepId> {
        let satisfied: HashSet<StepId> = self
            .steps
            .iter()
            .filter(|s| s.status.satisfies_dependency())
            .map(|s| s.id.clone())
            .collect();

        let mut newly_ready = Vec::new();
        for step in &mut self.steps {
            if step.status == StepStatus::Pending
                && step.depends_on.iter().all(|dep| satisfied.contains(dep))
            {
                step.status = StepStatus::Ready;
                newly_ready.push(step.id.clone());
            }
        }
        newly_ready
    }

    pub fn ready_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Ready)
            .collect()
    }

    pub fn all_steps_terminal(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(Step::is_terminal)
    }

    pub fn any_step_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Progress in [0, 1]. Swarm phases are weighted (scatter 0.3,
    /// critique 0.5, converge 0.2, normalized over present phases);
    /// composite progress is refined by the engine with child
    /// progress.
    pub fn progress(&self) -> f64 {
        match self.kind {
            WorkflowKind::Swarm => self.swarm_progress(),
            WorkflowKind::Composite => {
                let phases = match &self.topology {
                    TopologyConfig::Composite(config) => config.phases.len(),
                    _ => 0,
                };
                if phases == 0 {
                    return 0.0;
                }
                (self.current_phase.min(phases) as f64) / phases as f64
            }
            _ => {
                if self.steps.is_empty() {
                    return 0.0;
                }
                let done = self
                    .steps
                    .iter()
                    .filter(|s| s.status.satisfies_dependency())
                    .count();
                done as f64 / self.steps.len() as f64
            }
        }
    }

    fn swarm_progress(&self) -> f64 {
        let Some(sets) = &self.swarm_steps else {
            return 0.0;
        };
        let frac = |ids: &[StepId]| -> Option<f64> {
            if ids.is_empty() {
                return None;
            }
            let done = ids
                .iter()
                .filter(|id| {
                    self.step(id)
                        .map(|s| s.status.satisfies_dependency())
                        .unwrap_or(false)
                })
                .count();
            Some(done as f64 / ids.len() as f64)
        };

        let critique_ids: Vec<StepId> = sets.critique_rounds.iter().flatten().cloned().collect();
        let converge_ids = vec![sets.converge.clone()];

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (weight, fraction) in [
            (0.3, frac(&sets.scatter)),
            (0.5, frac(&critique_ids)),
            (0.2, frac(&converge_ids)),
        ] {
            if let Some(fraction) = fraction {
                weighted += weight * fraction;
                total_weight += weight;
            }
        }
        if total_weight == 0.0 {
            0.0
        } else {
            weighted / total_weight
        }
    }

    /// Record spend. The cap itself is enforced by the engine before
    /// an attempt is admitted.
    pub fn add_cost(&mut self, cost: f64) {
        self.economics.actual_cost += cost;
    }

    pub fn over_cost_cap(&self, additional: f64) -> bool {
        match self.cost_cap {
            Some(cap) => self.economics.actual_cost + additional > cap,
            None => false,
        }
    }
}
