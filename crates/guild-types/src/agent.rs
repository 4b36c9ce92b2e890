//! Agent profiles, tiers, and RACI assignments
//!
//! An agent is a record, not an object hierarchy: the tier field plus a
//! capability set distinguishes an executive from a worker. Behavior
//! per tier lives in the runtime crate.

use crate::ids::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Tier ─────────────────────────────────────────────────────────────

/// Organizational tier of an agent, top to bottom.
///
/// The variant order is rank order: `Executive` outranks everything,
/// `Worker` outranks nothing. Channel routing and the executor's cycle
/// order both rely on this ordering.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Executive,
    Vp,
    Director,
    #[default]
    Worker,
}

impl Tier {
    /// All tiers in executor cycle order (top of the hierarchy first).
    pub const ALL: [Tier; 4] = [Tier::Executive, Tier::Vp, Tier::Director, Tier::Worker];

    /// True if `self` sits strictly above `other` in the hierarchy.
    pub fn outranks(&self, other: Tier) -> bool {
        *self < other
    }

    /// Numeric depth from the top (executive = 0).
    pub fn depth(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Executive => write!(f, "executive"),
            Tier::Vp => write!(f, "vp"),
            Tier::Director => write!(f, "director"),
            Tier::Worker => write!(f, "worker"),
        }
    }
}

/// Kind of entity that owns a hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Executive,
    Vp,
    Director,
    Worker,
    /// A named pool of interchangeable workers.
    Pool,
}

impl From<Tier> for OwnerKind {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Executive => OwnerKind::Executive,
            Tier::Vp => OwnerKind::Vp,
            Tier::Director => OwnerKind::Director,
            Tier::Worker => OwnerKind::Worker,
        }
    }
}

// ── Agent profile ────────────────────────────────────────────────────

/// The registry record for a single agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent identifier.
    pub id: AgentId,
    /// Human-readable role name ("VP of Engineering").
    pub role: String,
    /// Organizational tier.
    pub tier: Tier,
    /// Department, if the organization uses them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Capabilities this agent can be scheduled against.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Softer skill descriptors, not used for matching.
    #[serde(default)]
    pub skills: BTreeSet<String>,
    /// Direct superior. `None` only for executives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_to: Option<AgentId>,
    /// Direct subordinates, maintained by the org registry.
    #[serde(default)]
    pub direct_reports: BTreeSet<AgentId>,
}

impl AgentProfile {
    pub fn new(id: AgentId, role: impl Into<String>, tier: Tier) -> Self {
        Self {
            id,
            role: role.into(),
            tier,
            department: None,
            capabilities: BTreeSet::new(),
            skills: BTreeSet::new(),
            reports_to: None,
            direct_reports: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skills.insert(skill.into());
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn reporting_to(mut self, superior: AgentId) -> Self {
        self.reports_to = Some(superior);
        self
    }

    /// True if this agent's capability set covers `required`.
    pub fn can_do(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

// ── RACI ─────────────────────────────────────────────────────────────

/// RACI assignments for a molecule.
///
/// Exactly one accountable agent exists at all times; the constructor
/// takes it and there is no way to unset it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaciAssignments {
    pub accountable: AgentId,
    #[serde(default)]
    pub responsible: BTreeSet<AgentId>,
    #[serde(default)]
    pub consulted: BTreeSet<AgentId>,
    #[serde(default)]
    pub informed: BTreeSet<AgentId>,
}

impl RaciAssignments {
    pub fn new(accountable: AgentId) -> Self {
        Self {
            accountable,
            responsible: BTreeSet::new(),
            consulted: BTreeSet::new(),
            informed: BTreeSet::new(),
        }
    }

    pub fn with_responsible(mut self, agent: AgentId) -> Self {
        self.responsible.insert(agent);
        self
    }

    pub fn with_consulted(mut self, agent: AgentId) -> Self {
        self.consulted.insert(agent);
        self
    }

    pub fn with_informed(mut self, agent: AgentId) -> Self {
        self.informed.insert(agent);
        self
    }

    /// Reassign accountability to a different agent.
    pub fn reassign_accountable(&mut self, agent: AgentId) {
        self.accountable = agent;
    }
}
