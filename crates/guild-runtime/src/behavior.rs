//! Per-tier agent behavior
//!
//! One behavior interface, implemented once per tier: managers
//! (executive, VP, director) coordinate and delegate; workers execute
//! through the language-model backend. Behaviors never touch shared
//! state directly; everything goes through the [`Core`] managers.

use crate::guild::Core;
use crate::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use guild_channels::Message;
use guild_gates::SubmissionStatus;
use guild_hooks::WorkItem;
use guild_ledger::EntityKind;
use guild_types::{AgentProfile, CancelToken, FailureKind, OwnerId, Tier};
use serde_json::json;
use tracing::{debug, warn};

/// What an agent does each cycle: read messages, claim work, execute.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Handle one inbox message.
    async fn process_message(
        &self,
        core: &Core,
        agent: &AgentProfile,
        message: &Message,
    ) -> RuntimeResult<()>;

    /// Take the next item from the agent's hook and mark its step in
    /// progress. Default covers every tier.
    async fn claim_work(
        &self,
        core: &Core,
        agent: &AgentProfile,
    ) -> RuntimeResult<Option<WorkItem>> {
        let owner: OwnerId = (&agent.id).into();
        let item = match core.hooks.claim(&owner).await {
            Ok(item) => item,
            // An item already in progress (e.g. awaiting a gate
            // decision) is not new work.
            Err(guild_hooks::HookError::ClaimConflict(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(item) = item else { return Ok(None) };

        if let Err(err) = core
            .engine
            .mark_step_in_progress(&item.molecule_id, &item.step_id)
            .await
        {
            // The step is no longer runnable (paused or settled
            // elsewhere); put the item back untouched.
            warn!(item = %item.id, error = %err, "step not runnable, releasing item");
            core.hooks.release(&owner, &item.id).await?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Execute one claimed item to completion or failure.
    async fn execute_task(
        &self,
        core: &Core,
        agent: &AgentProfile,
        item: WorkItem,
        cancel: &CancelToken,
    ) -> RuntimeResult<()>;
}

// ── Managers ─────────────────────────────────────────────────────────

/// Executive, VP, and director behavior: acknowledge reports and
/// delegate claimed coordination work down the chain.
pub struct ManagerBehavior {
    tier: Tier,
}

impl ManagerBehavior {
    pub fn new(tier: Tier) -> Self {
        Self { tier }
    }
}

#[async_trait]
impl AgentBehavior for ManagerBehavior {
    async fn process_message(
        &self,
        core: &Core,
        agent: &AgentProfile,
        message: &Message,
    ) -> RuntimeResult<()> {
        core.channels.mark_delivered(&message.id).await?;
        core.channels.mark_read(&message.id).await?;
        debug!(
            agent = %agent.id,
            tier = %self.tier,
            from = %message.sender,
            subject = %message.subject,
            "message read"
        );
        Ok(())
    }

    async fn execute_task(
        &self,
        core: &Core,
        agent: &AgentProfile,
        item: WorkItem,
        cancel: &CancelToken,
    ) -> RuntimeResult<()> {
        let owner: OwnerId = (&agent.id).into();
        if cancel.check().is_err() {
            return release_cancelled(core, &owner, &item).await;
        }

        // Delegate context downward before closing out the
        // coordination item.
        if let Some(report) = agent.direct_reports.iter().next() {
            core.channels
                .send(
                    &agent.id,
                    guild_channels::ChannelKind::Downchain,
                    &[report.clone()],
                    format!("delegated: {}", item.instruction),
                    format!(
                        "Work item {} for molecule {} is moving through your lane.",
                        item.id, item.molecule_id
                    ),
                    item.priority,
                    None,
                )
                .await?;
        }

        core.finish_work_item(&owner, &item, json!({ "delegated_by": agent.id }))
            .await?;
        Ok(())
    }
}

// ── Workers ──────────────────────────────────────────────────────────

/// Worker behavior: execute items through the LLM backend, account
/// for cost, and pass gate steps through their gates.
pub struct WorkerBehavior;

#[async_trait]
impl AgentBehavior for WorkerBehavior {
    async fn process_message(
        &self,
        core: &Core,
        agent: &AgentProfile,
        message: &Message,
    ) -> RuntimeResult<()> {
        core.channels.mark_delivered(&message.id).await?;
        core.channels.mark_read(&message.id).await?;
        debug!(agent = %agent.id, subject = %message.subject, "message read");
        Ok(())
    }

    async fn execute_task(
        &self,
        core: &Core,
        agent: &AgentProfile,
        item: WorkItem,
        cancel: &CancelToken,
    ) -> RuntimeResult<()> {
        let owner: OwnerId = (&agent.id).into();
        if cancel.check().is_err() {
            return release_cancelled(core, &owner, &item).await;
        }

        // Admit the attempt under the molecule's cost cap.
        let estimate = item.estimated_cost.unwrap_or(0.0);
        if estimate > 0.0 {
            if let Err(err) = core.engine.begin_attempt(&item.molecule_id, estimate).await {
                // Cost-capped: the molecule already failed; close the
                // item out permanently.
                core.hooks
                    .fail(&owner, &item.id, &err.to_string(), false)
                    .await?;
                return Ok(());
            }
        }

        let response = core
            .collaborators
            .llm
            .execute(&item.instruction, &[], None, cancel)
            .await;

        let response = match response {
            Ok(response) => response,
            Err(crate::collaborators::LlmError::Cancelled) => {
                return release_cancelled(core, &owner, &item).await;
            }
            Err(err) => {
                core.fail_work_item(
                    &owner,
                    &item,
                    &err.to_string(),
                    true,
                    FailureKind::ExternalDependency,
                )
                .await?;
                return Ok(());
            }
        };

        if response.cost > 0.0 {
            if let Err(err) = core
                .engine
                .record_attempt_cost(&item.molecule_id, response.cost)
                .await
            {
                // The spend crossed the cap; the molecule already
                // failed, so the item closes out permanently.
                core.hooks
                    .fail(&owner, &item.id, &err.to_string(), false)
                    .await?;
                return Ok(());
            }
        }

        let molecule = core.engine.get(&item.molecule_id).await?;
        let is_gate = molecule
            .step(&item.step_id)
            .map(|s| s.is_gate)
            .unwrap_or(false);

        if is_gate {
            // Submit the work product to the gate; approval (now or
            // later) is what completes the step.
            let artifacts = [("output".to_string(), response.content.clone())].into();
            let submission = core
                .gates
                .submit(
                    &molecule
                        .step(&item.step_id)
                        .and_then(|s| s.gate_id.clone())
                        .ok_or_else(|| {
                            RuntimeError::InvalidState(format!(
                                "gate step {} has no gate id",
                                item.step_id
                            ))
                        })?,
                    &item.molecule_id,
                    &item.step_id,
                    &agent.id,
                    artifacts,
                )
                .await?;

            core.hooks
                .complete(&owner, &item.id, json!({ "submission": submission.id }))
                .await?;
            if submission.status == SubmissionStatus::Approved {
                let ready = core
                    .engine
                    .complete_gate_step(&item.molecule_id, &item.step_id, &submission.id)
                    .await?;
                core.seed_steps(ready).await?;
            }
            return Ok(());
        }

        core.finish_work_item(
            &owner,
            &item,
            json!({ "output": response.content, "tokens": response.tokens }),
        )
        .await?;
        Ok(())
    }
}

/// Behavior for one tier.
pub fn behavior_for(tier: Tier) -> Box<dyn AgentBehavior> {
    match tier {
        Tier::Worker => Box::new(WorkerBehavior),
        other => Box::new(ManagerBehavior::new(other)),
    }
}

/// Cancellation path: a ledger entry, then the item goes back to
/// queued (not failed) and the step back to ready.
async fn release_cancelled(core: &Core, owner: &OwnerId, item: &WorkItem) -> RuntimeResult<()> {
    core.ledger
        .append(
            owner.as_str(),
            EntityKind::WorkItem,
            item.id.as_str(),
            "operation_cancelled",
            json!({ "molecule_id": item.molecule_id, "step_id": item.step_id }),
            None,
        )
        .await
        .map_err(guild_hooks::HookError::from)?;
    core.hooks.release(owner, &item.id).await?;
    core.engine
        .release_step(&item.molecule_id, &item.step_id)
        .await?;
    Ok(())
}
