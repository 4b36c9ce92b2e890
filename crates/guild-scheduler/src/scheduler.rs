//! The work scheduler
//!
//! Stateless across calls except for the pending-assignments queue
//! and the per-agent last-assignment stamps used for tie-breaking;
//! the agent inventory is always read through the org registry.

use crate::{ScheduleError, ScheduleResult};
use chrono::{DateTime, Utc};
use guild_hooks::{HookManager, WorkItem};
use guild_ledger::{EntityKind, Ledger};
use guild_molecule::MoleculeEngine;
use guild_org::OrgRegistry;
use guild_types::{AgentId, OwnerId, StepStatus, Tier};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where an item ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Assigned(AgentId),
    /// No candidate right now; the item waits in the pending queue.
    Parked,
}

#[derive(Clone, Debug)]
struct ParkedItem {
    item: WorkItem,
    required_tier: Option<Tier>,
    parked_at: DateTime<Utc>,
}

#[derive(Default)]
struct SchedulerState {
    last_assignment: HashMap<AgentId, DateTime<Utc>>,
    parked: Vec<ParkedItem>,
}

/// Assigns ready work items to agent hooks.
pub struct WorkScheduler {
    ledger: Arc<Ledger>,
    org: Arc<OrgRegistry>,
    hooks: Arc<HookManager>,
    engine: Arc<MoleculeEngine>,
    state: Mutex<SchedulerState>,
    /// Park unmatched items (the default) instead of failing fast
    /// with `CapabilityMismatch`.
    park_unmatched: bool,
}

impl WorkScheduler {
    pub fn new(
        ledger: Arc<Ledger>,
        org: Arc<OrgRegistry>,
        hooks: Arc<HookManager>,
        engine: Arc<MoleculeEngine>,
        park_unmatched: bool,
    ) -> Self {
        Self {
            ledger,
            org,
            hooks,
            engine,
            state: Mutex::new(SchedulerState::default()),
            park_unmatched,
        }
    }

    /// Schedule one work item.
    pub async fn schedule(
        &self,
        item: WorkItem,
        required_tier: Option<Tier>,
    ) -> ScheduleResult<ScheduleOutcome> {
        self.ensure_step_ready(&item).await?;
        let mut state = self.state.lock().await;
        self.place(&mut state, item, required_tier).await
    }

    /// Retry parked items after an agent joined.
    pub async fn register_agent(&self, agent_id: &AgentId) -> ScheduleResult<usize> {
        debug!(agent = %agent_id, "agent registered, retrying parked items");
        self.retry_parked().await
    }

    /// Retry parked items after an agent's profile changed.
    pub async fn update_agent(&self, agent_id: &AgentId) -> ScheduleResult<usize> {
        debug!(agent = %agent_id, "agent updated, retrying parked items");
        self.retry_parked().await
    }

    /// Periodic pass: retry parked items and surface starvation.
    pub async fn rebalance(&self) -> ScheduleResult<usize> {
        let placed = self.retry_parked().await?;
        let state = self.state.lock().await;
        let now = Utc::now();
        for parked in &state.parked {
            let waited = now.signed_duration_since(parked.parked_at);
            if waited > chrono::Duration::seconds(300) {
                warn!(
                    item = %parked.item.id,
                    waited_secs = waited.num_seconds(),
                    "work item starved in the pending-assignments queue"
                );
            }
        }
        Ok(placed)
    }

    /// Number of items waiting for a candidate.
    pub async fn parked_count(&self) -> usize {
        self.state.lock().await.parked.len()
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn ensure_step_ready(&self, item: &WorkItem) -> ScheduleResult<()> {
        let molecule = self.engine.get(&item.molecule_id).await?;
        let step = molecule
            .step(&item.step_id)
            .ok_or_else(|| ScheduleError::NotReady(item.step_id.clone()))?;
        if step.status != StepStatus::Ready {
            return Err(ScheduleError::NotReady(item.step_id.clone()));
        }
        Ok(())
    }

    async fn place(
        &self,
        state: &mut SchedulerState,
        item: WorkItem,
        required_tier: Option<Tier>,
    ) -> ScheduleResult<ScheduleOutcome> {
        let mut candidates = Vec::new();
        for profile in self.org.list().await {
            if let Some(tier) = required_tier {
                if profile.tier != tier {
                    continue;
                }
            }
            if !profile.can_do(&item.required_capabilities) {
                continue;
            }
            let owner: OwnerId = (&profile.id).into();
            let load = match self.hooks.load_of(&owner).await {
                Ok(load) => load,
                // No hook yet; the agent cannot take work.
                Err(_) => continue,
            };
            let last = state
                .last_assignment
                .get(&profile.id)
                .copied()
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            candidates.push((load, last, profile.id.clone()));
        }

        if candidates.is_empty() {
            if !self.park_unmatched {
                return Err(ScheduleError::CapabilityMismatch(format!(
                    "no agent offers {:?}",
                    item.required_capabilities
                )));
            }
            debug!(item = %item.id, "no candidate, parking");
            state.parked.push(ParkedItem {
                item,
                required_tier,
                parked_at: Utc::now(),
            });
            return Ok(ScheduleOutcome::Parked);
        }

        // Lightest queue first; ties to the agent assigned longest
        // ago, then to the smallest agent id.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        let chosen = candidates[0].2.clone();
        let owner: OwnerId = (&chosen).into();

        self.ledger
            .append(
                "scheduler",
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_scheduled",
                serde_json::json!({
                    "agent": chosen,
                    "molecule_id": item.molecule_id,
                    "step_id": item.step_id,
                    "priority": item.priority,
                }),
                None,
            )
            .await?;

        let item_id = item.id.clone();
        self.hooks.enqueue(&owner, item).await?;
        state.last_assignment.insert(chosen.clone(), Utc::now());
        info!(item = %item_id, agent = %chosen, "work item scheduled");
        Ok(ScheduleOutcome::Assigned(chosen))
    }

    async fn retry_parked(&self) -> ScheduleResult<usize> {
        let mut state = self.state.lock().await;
        let waiting = std::mem::take(&mut state.parked);
        let mut placed = 0;
        for parked in waiting {
            match self
                .place(&mut state, parked.item.clone(), parked.required_tier)
                .await?
            {
                ScheduleOutcome::Assigned(_) => placed += 1,
                ScheduleOutcome::Parked => {}
            }
        }
        Ok(placed)
    }
}
