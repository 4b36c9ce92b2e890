//! The executor
//!
//! Drives the corporation in cycles: one pass through the tiers in
//! order (executive → VP → director → worker), refreshing every hook
//! between tiers. That refresh is the cache-coherence point of the
//! whole system — it is what lets work delegated by tier T become
//! visible to tier T+1 within the same cycle.
//!
//! Stale-claim reclaim runs at the top of every cycle, so crashed
//! agents lose their claims on the next pass rather than on a
//! background timer.

use crate::behavior::behavior_for;
use crate::guild::Core;
use crate::RuntimeResult;
use chrono::Utc;
use guild_ledger::EntityKind;
use guild_types::{CancelToken, OwnerId, Tier};
use std::time::Duration;
use tracing::{debug, info};

/// What one cycle did.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleReport {
    pub messages_processed: usize,
    pub items_executed: usize,
    pub claims_reclaimed: usize,
}

/// Drives agents through cycles.
pub struct Executor {
    core: Core,
}

impl Executor {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// One pass: reclaim stale claims, then walk the tiers top-down.
    pub async fn run_cycle(&self, cancel: &CancelToken) -> RuntimeResult<CycleReport> {
        cancel.check()?;
        let mut report = CycleReport::default();

        // Crashed owners lose their claims first; their items go back
        // through the scheduler so another qualified agent picks them
        // up.
        let reclaimed = self.core.hooks.reclaim_stale(Utc::now()).await?;
        for (owner, item) in &reclaimed {
            self.core
                .engine
                .release_step(&item.molecule_id, &item.step_id)
                .await?;
            let item = self.core.hooks.take_queued(owner, &item.id).await?;
            self.core.scheduler.schedule(item, None).await?;
        }
        report.claims_reclaimed = reclaimed.len();

        for tier in Tier::ALL {
            let behavior = behavior_for(tier);
            for agent in self.core.org.agents_at_tier(tier).await {
                cancel.check()?;
                let owner: OwnerId = (&agent.id).into();
                self.core.hooks.heartbeat(&owner, Utc::now()).await?;

                for message in self.core.channels.inbox(&agent.id).await {
                    behavior.process_message(&self.core, &agent, &message).await?;
                    report.messages_processed += 1;
                }

                if let Some(item) = behavior.claim_work(&self.core, &agent).await? {
                    behavior
                        .execute_task(&self.core, &agent, item, cancel)
                        .await?;
                    report.items_executed += 1;
                }
            }

            // Coherence point: downstream tiers observe everything
            // this tier just delegated.
            self.core.hooks.refresh_all().await?;
        }

        debug!(
            messages = report.messages_processed,
            items = report.items_executed,
            reclaimed = report.claims_reclaimed,
            "cycle complete"
        );
        Ok(report)
    }

    /// Repeat cycles at a fixed interval until cancelled.
    pub async fn run_continuous(
        &self,
        interval: Duration,
        cancel: CancelToken,
    ) -> RuntimeResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.core
                        .ledger
                        .append(
                            "executor",
                            EntityKind::System,
                            "executor",
                            "executor_cancelled",
                            serde_json::json!({}),
                            None,
                        )
                        .await
                        .map_err(guild_hooks::HookError::from)?;
                    info!("continuous execution cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {
                    self.run_cycle(&cancel).await?;
                }
            }
        }
    }
}
