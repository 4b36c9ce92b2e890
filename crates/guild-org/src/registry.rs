//! The org registry
//!
//! Hire and terminate agents, maintain the reports-to graph, and
//! answer hierarchy queries (transitive subordinates, superior
//! chains). Profiles persist one record per agent under `org/`.

use crate::{OrgError, OrgResult};
use guild_ledger::{EntityKind, Ledger};
use guild_storage::{RecordKind, RecordStore};
use guild_types::{AgentId, AgentProfile, Tier};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Registry of hired agents and their reporting relationships.
pub struct OrgRegistry {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    agents: RwLock<HashMap<AgentId, AgentProfile>>,
}

impl OrgRegistry {
    /// Open the registry, loading any previously persisted profiles.
    pub async fn open(ledger: Arc<Ledger>, store: Arc<dyn RecordStore>) -> OrgResult<Self> {
        let mut agents = HashMap::new();
        for (_, body) in store.list(RecordKind::Org).await? {
            let profile: AgentProfile =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            agents.insert(profile.id.clone(), profile);
        }
        Ok(Self {
            ledger,
            store,
            agents: RwLock::new(agents),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Hire an agent into the organization.
    ///
    /// Non-executive agents must report to an existing agent; the
    /// superior's direct-report set is updated as part of the hire.
    pub async fn hire(&self, profile: AgentProfile) -> OrgResult<()> {
        let mut agents = self.agents.write().await;

        if agents.contains_key(&profile.id) {
            return Err(OrgError::InvalidState(format!(
                "agent {} already hired",
                profile.id
            )));
        }

        match &profile.reports_to {
            Some(superior) => {
                if !agents.contains_key(superior) {
                    return Err(OrgError::NotFound(superior.clone()));
                }
            }
            None => {
                if profile.tier != Tier::Executive {
                    return Err(OrgError::InvalidState(format!(
                        "non-executive agent {} must report to someone",
                        profile.id
                    )));
                }
            }
        }

        self.ledger
            .append(
                profile.id.as_str(),
                EntityKind::Agent,
                profile.id.as_str(),
                "agent_hired",
                serde_json::json!({
                    "role": profile.role,
                    "tier": profile.tier,
                    "reports_to": profile.reports_to,
                }),
                None,
            )
            .await?;

        if let Some(superior_id) = profile.reports_to.clone() {
            if let Some(superior) = agents.get_mut(&superior_id) {
                superior.direct_reports.insert(profile.id.clone());
                self.persist(superior).await?;
            }
        }

        self.persist(&profile).await?;
        info!(agent = %profile.id, role = %profile.role, tier = %profile.tier, "agent hired");
        agents.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Remove an agent. Refused while the agent still has direct
    /// reports; reassign them first.
    pub async fn terminate(&self, agent_id: &AgentId) -> OrgResult<AgentProfile> {
        let mut agents = self.agents.write().await;
        let profile = agents
            .get(agent_id)
            .ok_or_else(|| OrgError::NotFound(agent_id.clone()))?
            .clone();

        if !profile.direct_reports.is_empty() {
            return Err(OrgError::InvalidState(format!(
                "agent {} still has {} direct reports",
                agent_id,
                profile.direct_reports.len()
            )));
        }

        self.ledger
            .append(
                agent_id.as_str(),
                EntityKind::Agent,
                agent_id.as_str(),
                "agent_terminated",
                serde_json::json!({}),
                None,
            )
            .await?;

        if let Some(superior_id) = &profile.reports_to {
            if let Some(superior) = agents.get_mut(superior_id) {
                superior.direct_reports.remove(agent_id);
                self.persist(superior).await?;
            }
        }

        self.store.remove(RecordKind::Org, agent_id.as_str()).await?;
        agents.remove(agent_id);
        Ok(profile)
    }

    /// Replace an agent's profile (capabilities, skills, department).
    /// Reporting-line changes go through hire/terminate.
    pub async fn update(&self, profile: AgentProfile) -> OrgResult<()> {
        let mut agents = self.agents.write().await;
        let existing = agents
            .get(&profile.id)
            .ok_or_else(|| OrgError::NotFound(profile.id.clone()))?;

        if existing.reports_to != profile.reports_to {
            return Err(OrgError::InvalidState(
                "reporting-line changes are not updates".to_string(),
            ));
        }

        self.ledger
            .append(
                profile.id.as_str(),
                EntityKind::Agent,
                profile.id.as_str(),
                "agent_updated",
                serde_json::json!({ "capabilities": profile.capabilities }),
                None,
            )
            .await?;

        self.persist(&profile).await?;
        agents.insert(profile.id.clone(), profile);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get(&self, agent_id: &AgentId) -> OrgResult<AgentProfile> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| OrgError::NotFound(agent_id.clone()))
    }

    pub async fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    pub async fn list(&self) -> Vec<AgentProfile> {
        let mut profiles: Vec<_> = self.agents.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub async fn agents_at_tier(&self, tier: Tier) -> Vec<AgentProfile> {
        let mut profiles: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .filter(|p| p.tier == tier)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    /// All agents below `agent_id`, transitively, in breadth-first
    /// order.
    pub async fn subordinates(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let agents = self.agents.read().await;
        let mut result = Vec::new();
        let mut frontier = VecDeque::new();
        frontier.push_back(agent_id.clone());

        while let Some(current) = frontier.pop_front() {
            if let Some(profile) = agents.get(&current) {
                for report in &profile.direct_reports {
                    result.push(report.clone());
                    frontier.push_back(report.clone());
                }
            }
        }
        result
    }

    /// The chain of superiors from `agent_id` up to the root.
    pub async fn superiors(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let agents = self.agents.read().await;
        let mut result = Vec::new();
        let mut current = agents.get(agent_id).and_then(|p| p.reports_to.clone());
        while let Some(superior) = current {
            result.push(superior.clone());
            current = agents.get(&superior).and_then(|p| p.reports_to.clone());
        }
        result
    }

    /// True if `subordinate` transitively reports to `superior`.
    pub async fn is_in_chain(&self, superior: &AgentId, subordinate: &AgentId) -> bool {
        self.superiors(subordinate).await.contains(superior)
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn persist(&self, profile: &AgentProfile) -> OrgResult<()> {
        let body = serde_json::to_value(profile).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::Org, profile.id.as_str(), body)
            .await?;
        Ok(())
    }
}
