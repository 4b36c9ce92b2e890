//! Topology configuration
//!
//! The topology is a tagged variant on the molecule, not a flat
//! record: each family carries exactly the knobs it needs.

use guild_types::WorkflowKind;
use serde::{Deserialize, Serialize};

/// How a swarm's scattered outputs converge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStrategy {
    /// Majority vote; `min_agreement` applies.
    Vote,
    /// One synthesis over all outputs.
    #[default]
    Synthesize,
    /// Pick the single best output.
    Best,
    /// Merge all outputs.
    Merge,
}

/// Swarm topology: scatter → critique → converge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Number of parallel scatter steps (≥ 2).
    pub scatter_count: usize,
    /// Critique rounds between scatter and convergence.
    #[serde(default)]
    pub critique_rounds: usize,
    pub convergence: ConvergenceStrategy,
    /// Minimum agreement fraction; only meaningful for `Vote`.
    #[serde(default)]
    pub min_agreement: f64,
    /// Capability stamped onto the generated steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<String>,
}

/// Persistent-retry topology: one logical step in a retry loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cap: Option<f64>,
    /// Exit conditions, re-evaluated after every attempt. A bare name
    /// means "the context key is set"; `context:key=value` matches
    /// exactly.
    #[serde(default)]
    pub exit_criteria: Vec<String>,
}

/// What to do when a composite phase fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFailureAction {
    /// Mark the composite failed.
    #[default]
    Fail,
    /// Re-create the same phase, bounded by `max_failures`.
    Retry,
    /// Rewind to the previous phase.
    EscalateToPrevious,
    /// Insert a swarm research phase before the failed one.
    EscalateToSwarm,
}

/// One phase of a composite molecule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub topology: TopologyConfig,
    /// Steps of the child molecule. Swarm phases generate their own;
    /// a persistent-retry phase left empty gets one step named after
    /// the phase.
    #[serde(default)]
    pub steps: Vec<crate::spec::StepSpec>,
    pub on_failure: PhaseFailureAction,
    /// Attempt bound for `Retry`.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_max_failures() -> u32 {
    3
}

/// Composite topology: ordered phases, each a child molecule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeConfig {
    pub phases: Vec<PhaseSpec>,
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
}

fn default_max_escalations() -> u32 {
    2
}

/// Loop configuration for continuous and hybrid molecules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopConfig {
    pub interval_seconds: u64,
    /// `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub exit_criteria: Vec<String>,
}

/// Topology-specific configuration, tagged by family.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyConfig {
    Linear,
    Swarm(SwarmConfig),
    PersistentRetry(RetryConfig),
    Composite(CompositeConfig),
    Continuous(LoopConfig),
    /// A linear DAG that re-runs under a loop config.
    Hybrid(LoopConfig),
}

impl TopologyConfig {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            TopologyConfig::Linear => WorkflowKind::Linear,
            TopologyConfig::Swarm(_) => WorkflowKind::Swarm,
            TopologyConfig::PersistentRetry(_) => WorkflowKind::PersistentRetry,
            TopologyConfig::Composite(_) => WorkflowKind::Composite,
            TopologyConfig::Continuous(_) => WorkflowKind::Continuous,
            TopologyConfig::Hybrid(_) => WorkflowKind::Hybrid,
        }
    }

    /// The loop config, for topologies that iterate.
    pub fn loop_config(&self) -> Option<&LoopConfig> {
        match self {
            TopologyConfig::Continuous(config) | TopologyConfig::Hybrid(config) => Some(config),
            _ => None,
        }
    }
}

/// Evaluate an exit criterion against a molecule's context map.
pub(crate) fn exit_criterion_met(
    expression: &str,
    context: &std::collections::BTreeMap<String, String>,
) -> bool {
    let rest = expression.strip_prefix("context:").unwrap_or(expression);
    match rest.split_once('=') {
        Some((key, expected)) => context.get(key).map(String::as_str) == Some(expected),
        None => context.get(rest).map(|v| !v.is_empty()).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn kinds_round_trip() {
        let swarm = TopologyConfig::Swarm(SwarmConfig {
            scatter_count: 3,
            critique_rounds: 1,
            convergence: ConvergenceStrategy::Synthesize,
            min_agreement: 0.0,
            required_capability: None,
        });
        assert_eq!(swarm.kind(), WorkflowKind::Swarm);
        let json = serde_json::to_string(&swarm).unwrap();
        let back: TopologyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), WorkflowKind::Swarm);
    }

    #[test]
    fn exit_criteria_accept_bare_keys() {
        let mut context = BTreeMap::new();
        context.insert("tests_pass".to_string(), "true".to_string());
        assert!(exit_criterion_met("tests_pass", &context));
        assert!(exit_criterion_met("context:tests_pass", &context));
        assert!(exit_criterion_met("context:tests_pass=true", &context));
        assert!(!exit_criterion_met("context:tests_pass=false", &context));
        assert!(!exit_criterion_met("coverage_ok", &context));
    }

    #[test]
    fn only_looping_topologies_have_loop_config() {
        let continuous = TopologyConfig::Continuous(LoopConfig {
            interval_seconds: 60,
            max_iterations: Some(3),
            exit_criteria: vec![],
        });
        assert!(continuous.loop_config().is_some());
        assert!(TopologyConfig::Linear.loop_config().is_none());
    }
}
