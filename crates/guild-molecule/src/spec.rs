//! Molecule specifications and templates
//!
//! A [`MoleculeSpec`] is the declarative input to
//! [`crate::MoleculeEngine::create`]: step dependencies are declared
//! by step *name*, and the engine resolves them to ids at creation.
//! Specs also serve as reusable templates under
//! `molecules/templates/`.

use crate::step::Step;
use crate::topology::TopologyConfig;
use guild_types::{AgentId, GateId, OwnerId, Priority, RaciAssignments};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Declarative description of one step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Names of steps in the same spec this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<OwnerId>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub is_gate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<GateId>,
    #[serde(default = "default_step_retries")]
    pub max_retries: u32,
}

fn default_step_retries() -> u32 {
    3
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            assignee: None,
            priority: Priority::default(),
            required_capabilities: BTreeSet::new(),
            is_gate: false,
            gate_id: None,
            max_retries: default_step_retries(),
        }
    }

    pub fn depends(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn gated_by(mut self, gate_id: GateId) -> Self {
        self.is_gate = true;
        self.gate_id = Some(gate_id);
        self
    }

    pub(crate) fn build(&self) -> Step {
        let mut step = Step::new(self.name.clone());
        step.assignee = self.assignee.clone();
        step.priority = self.priority;
        step.required_capabilities = self.required_capabilities.clone();
        step.is_gate = self.is_gate;
        step.gate_id = self.gate_id.clone();
        step.max_retries = self.max_retries;
        step
    }
}

/// Declarative description of a molecule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoleculeSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub creator: AgentId,
    pub raci: RaciAssignments,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
}

impl MoleculeSpec {
    pub fn new(
        name: impl Into<String>,
        creator: AgentId,
        accountable: AgentId,
        topology: TopologyConfig,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            creator,
            raci: RaciAssignments::new(accountable),
            topology,
            steps: Vec::new(),
            cost_cap: None,
            estimated_cost: None,
            estimated_value: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_cost_cap(mut self, cap: f64) -> Self {
        self.cost_cap = Some(cap);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_collects_steps() {
        let spec = MoleculeSpec::new(
            "release",
            AgentId::new("vp-eng"),
            AgentId::new("vp-eng"),
            TopologyConfig::Linear,
        )
        .step(StepSpec::new("a"))
        .step(StepSpec::new("b").depends("a").with_priority(Priority::P1));

        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[1].depends_on, vec!["a"]);
        assert_eq!(spec.raci.accountable, AgentId::new("vp-eng"));
    }
}
