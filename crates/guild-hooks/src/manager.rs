//! The hook manager
//!
//! Owns every hook in the process. Each hook lives behind its own
//! mutex, so operations on different owners run in parallel while all
//! mutations of one hook form a sequential history. Every mutation
//! writes its ledger entry before the new state becomes visible, then
//! persists the hook record.

use crate::hook::{Hook, HookSnapshot, HookStats};
use crate::item::WorkItem;
use crate::{HookError, HookResult};
use chrono::{DateTime, Duration, Utc};
use guild_ledger::{EntityKind, Ledger};
use guild_storage::{RecordKind, RecordStore};
use guild_types::{OwnerId, OwnerKind, WorkItemId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// What happened to a failed item.
#[derive(Clone, Debug)]
pub enum FailDisposition {
    /// Requeued for another attempt; the new retry count.
    Requeued(u32),
    /// Retry budget spent; the item is permanently failed and the
    /// caller should fail the owning step.
    Exhausted(WorkItem),
}

/// Manager of all per-owner work queues.
pub struct HookManager {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    hooks: RwLock<HashMap<OwnerId, Arc<Mutex<Hook>>>>,
    /// How long a claim may sit without a heartbeat before reclaim.
    stale_after: Duration,
}

impl HookManager {
    pub fn new(ledger: Arc<Ledger>, store: Arc<dyn RecordStore>, stale_after: Duration) -> Self {
        Self {
            ledger,
            store,
            hooks: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    /// Load all persisted hook records (process restart).
    pub async fn load(&self) -> HookResult<usize> {
        let records = self.store.list(RecordKind::Hook).await?;
        let mut hooks = self.hooks.write().await;
        let mut loaded = 0;
        for (_, body) in records {
            let hook: Hook =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            hooks.insert(hook.owner.clone(), Arc::new(Mutex::new(hook)));
            loaded += 1;
        }
        info!(loaded, "hooks loaded from storage");
        Ok(loaded)
    }

    /// Create a hook for a new owner. Idempotent.
    pub async fn create_hook(&self, owner: OwnerId, owner_kind: OwnerKind) -> HookResult<()> {
        let mut hooks = self.hooks.write().await;
        if hooks.contains_key(&owner) {
            return Ok(());
        }

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::Hook,
                owner.as_str(),
                "hook_created",
                serde_json::json!({ "owner_kind": owner_kind }),
                None,
            )
            .await?;

        let hook = Hook::new(owner.clone(), owner_kind);
        self.persist(&hook).await?;
        hooks.insert(owner, Arc::new(Mutex::new(hook)));
        Ok(())
    }

    pub async fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<_> = self.hooks.read().await.keys().cloned().collect();
        owners.sort();
        owners
    }

    // ── Queue operations ─────────────────────────────────────────────

    /// Insert an item into an owner's queue.
    pub async fn enqueue(&self, owner: &OwnerId, item: WorkItem) -> HookResult<()> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_enqueued",
                serde_json::json!({
                    "owner": owner,
                    "priority": item.priority,
                    "molecule_id": item.molecule_id,
                    "step_id": item.step_id,
                }),
                None,
            )
            .await?;

        hook.push(item);
        self.persist(&hook).await?;
        Ok(())
    }

    /// Atomically take the highest-priority item and mark it in
    /// progress. Returns `None` on an empty queue. A second claim
    /// before completion fails with `ClaimConflict` and changes
    /// nothing.
    pub async fn claim(&self, owner: &OwnerId) -> HookResult<Option<WorkItem>> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;

        if hook.claimed.is_some() {
            return Err(HookError::ClaimConflict(owner.clone()));
        }

        let Some(mut item) = hook.pop() else {
            return Ok(None);
        };
        item.claimed_at = Some(Utc::now());

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_claimed",
                serde_json::json!({ "owner": owner, "retry_count": item.retry_count }),
                None,
            )
            .await?;

        hook.stats.in_progress = 1;
        hook.claimed = Some(item.clone());
        self.persist(&hook).await?;
        debug!(owner = %owner, item = %item.id, "work item claimed");
        Ok(Some(item))
    }

    /// Complete the claimed item.
    pub async fn complete(
        &self,
        owner: &OwnerId,
        item_id: &WorkItemId,
        result: serde_json::Value,
    ) -> HookResult<WorkItem> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;
        let item = self.take_claimed(&mut hook, item_id)?;

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_completed",
                serde_json::json!({ "owner": owner, "result": result }),
                None,
            )
            .await?;

        hook.stats.in_progress = 0;
        hook.stats.completed += 1;
        self.persist(&hook).await?;
        debug!(owner = %owner, item = %item.id, "work item completed");
        Ok(item)
    }

    /// Fail the claimed item. Retryable failures with remaining
    /// budget requeue the item; everything else fails it permanently.
    pub async fn fail(
        &self,
        owner: &OwnerId,
        item_id: &WorkItemId,
        error: &str,
        retryable: bool,
    ) -> HookResult<FailDisposition> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;
        let mut item = self.take_claimed(&mut hook, item_id)?;
        hook.stats.in_progress = 0;

        if retryable && !item.retries_exhausted() {
            item.retry_count += 1;
            item.claimed_at = None;
            let retry_count = item.retry_count;

            self.ledger
                .append(
                    owner.as_str(),
                    EntityKind::WorkItem,
                    item.id.as_str(),
                    "work_item_retried",
                    serde_json::json!({
                        "owner": owner,
                        "error": error,
                        "retry_count": retry_count,
                    }),
                    None,
                )
                .await?;

            hook.push(item);
            self.persist(&hook).await?;
            return Ok(FailDisposition::Requeued(retry_count));
        }

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_failed",
                serde_json::json!({
                    "owner": owner,
                    "error": error,
                    "retry_count": item.retry_count,
                    "retryable": retryable,
                }),
                None,
            )
            .await?;

        hook.stats.failed += 1;
        self.persist(&hook).await?;
        warn!(owner = %owner, item = %item.id, error, "work item failed permanently");
        Ok(FailDisposition::Exhausted(item))
    }

    /// Release the claimed item back to queued without spending a
    /// retry. This is the cancellation path: a cancelled operation
    /// must not fail its item.
    pub async fn release(&self, owner: &OwnerId, item_id: &WorkItemId) -> HookResult<()> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;
        let mut item = self.take_claimed(&mut hook, item_id)?;
        item.claimed_at = None;

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_released",
                serde_json::json!({ "owner": owner }),
                None,
            )
            .await?;

        hook.stats.in_progress = 0;
        hook.push(item);
        self.persist(&hook).await?;
        Ok(())
    }

    /// Remove a queued (never in-progress) item from an owner's
    /// queue, for scheduler reassignment to another hook.
    pub async fn take_queued(
        &self,
        owner: &OwnerId,
        item_id: &WorkItemId,
    ) -> HookResult<WorkItem> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;
        let Some(item) = hook.take_queued(item_id) else {
            return Err(HookError::ItemNotFound(item_id.clone()));
        };

        self.ledger
            .append(
                "hook-manager",
                EntityKind::WorkItem,
                item.id.as_str(),
                "work_item_unqueued",
                serde_json::json!({ "owner": owner }),
                None,
            )
            .await?;
        self.persist(&hook).await?;
        Ok(item)
    }

    // ── Liveness ─────────────────────────────────────────────────────

    /// Record a sign of life from the owner.
    pub async fn heartbeat(&self, owner: &OwnerId, timestamp: DateTime<Utc>) -> HookResult<()> {
        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;

        self.ledger
            .append(
                owner.as_str(),
                EntityKind::Hook,
                owner.as_str(),
                "hook_heartbeat",
                serde_json::json!({ "at": timestamp }),
                None,
            )
            .await?;

        hook.last_heartbeat = Some(timestamp);
        self.persist(&hook).await?;
        Ok(())
    }

    /// Sweep every hook for claims that went stale and move them back
    /// to queued with an incremented retry count. Returns the
    /// reclaimed items. This is how crashed agents lose ownership.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> HookResult<Vec<(OwnerId, WorkItem)>> {
        let hooks: Vec<_> = {
            let guard = self.hooks.read().await;
            guard.values().cloned().collect()
        };

        let mut reclaimed = Vec::new();
        for hook in hooks {
            let mut hook = hook.lock().await;
            let stale = hook
                .claim_age(now)
                .map(|age| age >= self.stale_after)
                .unwrap_or(false);
            if !stale {
                continue;
            }

            // take_claimed cannot fail here: claim_age implies a claim.
            let Some(mut item) = hook.claimed.take() else {
                continue;
            };
            item.retry_count += 1;
            item.claimed_at = None;

            self.ledger
                .append(
                    "hook-manager",
                    EntityKind::WorkItem,
                    item.id.as_str(),
                    "work_item_reclaimed",
                    serde_json::json!({
                        "owner": hook.owner,
                        "retry_count": item.retry_count,
                        "stale_after_secs": self.stale_after.num_seconds(),
                    }),
                    None,
                )
                .await?;

            hook.stats.in_progress = 0;
            hook.push(item.clone());
            self.persist(&hook).await?;
            warn!(owner = %hook.owner, item = %item.id, "stale claim reclaimed");
            reclaimed.push((hook.owner.clone(), item));
        }
        Ok(reclaimed)
    }

    // ── Coherence and observation ────────────────────────────────────

    /// Reload one hook from durable storage. The executor calls this
    /// for every hook between tiers so downstream tiers observe work
    /// delegated upstream in the same cycle.
    pub async fn refresh(&self, owner: &OwnerId) -> HookResult<()> {
        let record = self
            .store
            .get(RecordKind::Hook, owner.as_str())
            .await?
            .ok_or_else(|| HookError::HookNotFound(owner.clone()))?;
        let fresh: Hook =
            serde_json::from_value(record).map_err(guild_storage::StorageError::from)?;

        let hook = self.hook_for(owner).await?;
        let mut hook = hook.lock().await;
        *hook = fresh;
        Ok(())
    }

    /// Refresh every hook.
    pub async fn refresh_all(&self) -> HookResult<()> {
        for owner in self.owners().await {
            self.refresh(&owner).await?;
        }
        Ok(())
    }

    pub async fn stats(&self, owner: &OwnerId) -> HookResult<HookStats> {
        let hook = self.hook_for(owner).await?;
        let hook = hook.lock().await;
        Ok(hook.stats)
    }

    /// Point-in-time view of one hook. Atomic per hook, not across
    /// hooks.
    pub async fn snapshot(&self, owner: &OwnerId) -> HookResult<HookSnapshot> {
        let hook = self.hook_for(owner).await?;
        let hook = hook.lock().await;
        Ok(HookSnapshot::from(&*hook))
    }

    pub async fn snapshots(&self) -> Vec<HookSnapshot> {
        let hooks: Vec<_> = {
            let guard = self.hooks.read().await;
            guard.values().cloned().collect()
        };
        let mut snapshots = Vec::new();
        for hook in hooks {
            let hook = hook.lock().await;
            snapshots.push(HookSnapshot::from(&*hook));
        }
        snapshots.sort_by(|a, b| a.owner.cmp(&b.owner));
        snapshots
    }

    /// Current load (queue depth including claim) per owner, for the
    /// scheduler.
    pub async fn load_of(&self, owner: &OwnerId) -> HookResult<usize> {
        let hook = self.hook_for(owner).await?;
        let hook = hook.lock().await;
        Ok(hook.load())
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn hook_for(&self, owner: &OwnerId) -> HookResult<Arc<Mutex<Hook>>> {
        self.hooks
            .read()
            .await
            .get(owner)
            .cloned()
            .ok_or_else(|| HookError::HookNotFound(owner.clone()))
    }

    fn take_claimed(&self, hook: &mut Hook, item_id: &WorkItemId) -> HookResult<WorkItem> {
        match hook.claimed.take() {
            Some(item) if &item.id == item_id => Ok(item),
            Some(other) => {
                // Not the claimed item; put it back.
                hook.claimed = Some(other);
                Err(HookError::ItemNotFound(item_id.clone()))
            }
            None => Err(HookError::ItemNotFound(item_id.clone())),
        }
    }

    async fn persist(&self, hook: &Hook) -> HookResult<()> {
        let body = serde_json::to_value(hook).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::Hook, hook.owner.as_str(), body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guild_ledger::MemoryLedgerStorage;
    use guild_storage::MemoryRecordStore;
    use guild_types::{MoleculeId, Priority, StepId};

    fn make_item(priority: Priority) -> WorkItem {
        WorkItem::new(MoleculeId::new("m1"), StepId::generate(), priority, "work")
    }

    async fn make_manager() -> HookManager {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store = Arc::new(MemoryRecordStore::new());
        let manager = HookManager::new(ledger, store, Duration::seconds(300));
        manager
            .create_hook(OwnerId::new("w1"), OwnerKind::Worker)
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn claim_follows_priority_order() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");

        let background = make_item(Priority::P3);
        let urgent = make_item(Priority::P0);
        manager.enqueue(&owner, background.clone()).await.unwrap();
        manager.enqueue(&owner, urgent.clone()).await.unwrap();

        let claimed = manager.claim(&owner).await.unwrap().unwrap();
        assert_eq!(claimed.id, urgent.id);
        assert!(claimed.claimed_at.is_some());
    }

    #[tokio::test]
    async fn second_claim_conflicts_and_leaves_state_unchanged() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");
        manager.enqueue(&owner, make_item(Priority::P2)).await.unwrap();
        manager.enqueue(&owner, make_item(Priority::P2)).await.unwrap();

        let first = manager.claim(&owner).await.unwrap().unwrap();
        let second = manager.claim(&owner).await;
        assert!(matches!(second, Err(HookError::ClaimConflict(_))));

        // The original claim is intact and completable.
        let stats = manager.stats(&owner).await.unwrap();
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.queued, 1);
        manager
            .complete(&owner, &first.id, serde_json::json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_on_empty_queue_is_none() {
        let manager = make_manager().await;
        assert!(manager.claim(&OwnerId::new("w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_incremented_count() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");
        manager
            .enqueue(&owner, make_item(Priority::P2).with_max_retries(2))
            .await
            .unwrap();

        let item = manager.claim(&owner).await.unwrap().unwrap();
        let disposition = manager.fail(&owner, &item.id, "flaky", true).await.unwrap();
        assert!(matches!(disposition, FailDisposition::Requeued(1)));

        let again = manager.claim(&owner).await.unwrap().unwrap();
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.id, item.id);
    }

    #[tokio::test]
    async fn retries_exhaust_after_max_retries() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");
        manager
            .enqueue(&owner, make_item(Priority::P2).with_max_retries(1))
            .await
            .unwrap();

        // Attempt 1 fails, requeued (retry 1 of 1).
        let item = manager.claim(&owner).await.unwrap().unwrap();
        assert!(matches!(
            manager.fail(&owner, &item.id, "boom", true).await.unwrap(),
            FailDisposition::Requeued(1)
        ));

        // Attempt 2 fails with the budget spent.
        let item = manager.claim(&owner).await.unwrap().unwrap();
        let disposition = manager.fail(&owner, &item.id, "boom", true).await.unwrap();
        assert!(matches!(disposition, FailDisposition::Exhausted(_)));
        assert_eq!(manager.stats(&owner).await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_immediately_permanent() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");
        manager.enqueue(&owner, make_item(Priority::P2)).await.unwrap();

        let item = manager.claim(&owner).await.unwrap().unwrap();
        let disposition = manager
            .fail(&owner, &item.id, "validation", false)
            .await
            .unwrap();
        assert!(matches!(disposition, FailDisposition::Exhausted(_)));
    }

    #[tokio::test]
    async fn release_returns_item_without_spending_retry() {
        let manager = make_manager().await;
        let owner = OwnerId::new("w1");
        manager.enqueue(&owner, make_item(Priority::P2)).await.unwrap();

        let item = manager.claim(&owner).await.unwrap().unwrap();
        manager.release(&owner, &item.id).await.unwrap();

        let again = manager.claim(&owner).await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.retry_count, 0);
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store = Arc::new(MemoryRecordStore::new());
        let manager = HookManager::new(ledger, store, Duration::seconds(300));
        let owner = OwnerId::new("w2");
        manager
            .create_hook(owner.clone(), OwnerKind::Worker)
            .await
            .unwrap();
        manager.enqueue(&owner, make_item(Priority::P1)).await.unwrap();

        let item = manager.claim(&owner).await.unwrap().unwrap();

        // Not yet stale.
        let reclaimed = manager.reclaim_stale(Utc::now()).await.unwrap();
        assert!(reclaimed.is_empty());

        // Well past the threshold with no heartbeat.
        let later = Utc::now() + Duration::seconds(600);
        let reclaimed = manager.reclaim_stale(later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].1.id, item.id);
        assert_eq!(reclaimed[0].1.retry_count, 1);

        // Another owner claim succeeds now that the slot is free.
        let again = manager.claim(&owner).await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
    }

    #[tokio::test]
    async fn heartbeat_defers_reclaim() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store = Arc::new(MemoryRecordStore::new());
        let manager = HookManager::new(ledger, store, Duration::seconds(300));
        let owner = OwnerId::new("w3");
        manager
            .create_hook(owner.clone(), OwnerKind::Worker)
            .await
            .unwrap();
        manager.enqueue(&owner, make_item(Priority::P1)).await.unwrap();
        manager.claim(&owner).await.unwrap().unwrap();

        let later = Utc::now() + Duration::seconds(600);
        manager.heartbeat(&owner, later).await.unwrap();

        let reclaimed = manager.reclaim_stale(later).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn refresh_reloads_persisted_state() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
        let manager = HookManager::new(ledger.clone(), store.clone(), Duration::seconds(300));
        let owner = OwnerId::new("w1");
        manager
            .create_hook(owner.clone(), OwnerKind::Worker)
            .await
            .unwrap();
        manager.enqueue(&owner, make_item(Priority::P2)).await.unwrap();

        // A second manager over the same storage (same process, other
        // component's view).
        let other = HookManager::new(ledger, store, Duration::seconds(300));
        other.load().await.unwrap();
        other.enqueue(&owner, make_item(Priority::P0)).await.unwrap();

        // Before refresh the first manager sees one item; after, two.
        assert_eq!(manager.stats(&owner).await.unwrap().queued, 1);
        manager.refresh(&owner).await.unwrap();
        assert_eq!(manager.stats(&owner).await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn hooks_reload_after_restart() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
        {
            let manager = HookManager::new(ledger.clone(), store.clone(), Duration::seconds(300));
            manager
                .create_hook(OwnerId::new("w1"), OwnerKind::Worker)
                .await
                .unwrap();
            manager
                .enqueue(&OwnerId::new("w1"), make_item(Priority::P2))
                .await
                .unwrap();
        }

        let manager = HookManager::new(ledger, store, Duration::seconds(300));
        assert_eq!(manager.load().await.unwrap(), 1);
        assert!(manager
            .claim(&OwnerId::new("w1"))
            .await
            .unwrap()
            .is_some());
    }
}
