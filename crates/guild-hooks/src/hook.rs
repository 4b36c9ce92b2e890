//! The hook record
//!
//! A hook is one owner's queue plus its claim slot and counters. The
//! whole record serializes as one JSON document under `hooks/`, which
//! is what `refresh` reloads at executor cycle boundaries.

use crate::item::WorkItem;
use chrono::{DateTime, Utc};
use guild_types::{OwnerId, OwnerKind, WorkItemId};
use serde::{Deserialize, Serialize};

/// A queued item with its arrival stamp. Ordering is
/// (priority, arrival, item id) — strict priority first, FIFO within
/// a priority, item id as the (unreachable in practice) final
/// tie-break.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedItem {
    pub item: WorkItem,
    pub arrival: u64,
}

impl QueuedItem {
    fn sort_key(&self) -> (guild_types::Priority, u64, WorkItemId) {
        (self.item.priority, self.arrival, self.item.id.clone())
    }
}

/// Queue/claim counters for one hook.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct HookStats {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One owner's work queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hook {
    pub owner: OwnerId,
    pub owner_kind: OwnerKind,
    queue: Vec<QueuedItem>,
    /// The single item currently in progress, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed: Option<WorkItem>,
    pub stats: HookStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    arrival_counter: u64,
}

impl Hook {
    pub fn new(owner: OwnerId, owner_kind: OwnerKind) -> Self {
        Self {
            owner,
            owner_kind,
            queue: Vec::new(),
            claimed: None,
            stats: HookStats::default(),
            last_heartbeat: None,
            arrival_counter: 0,
        }
    }

    /// Insert an item in queue order.
    pub fn push(&mut self, item: WorkItem) {
        self.arrival_counter += 1;
        let queued = QueuedItem {
            item,
            arrival: self.arrival_counter,
        };
        let position = self
            .queue
            .binary_search_by_key(&queued.sort_key(), QueuedItem::sort_key)
            .unwrap_or_else(|pos| pos);
        self.queue.insert(position, queued);
        self.stats.queued += 1;
    }

    /// Remove and return the highest-priority item.
    pub fn pop(&mut self) -> Option<WorkItem> {
        if self.queue.is_empty() {
            return None;
        }
        let queued = self.queue.remove(0);
        self.stats.queued = self.stats.queued.saturating_sub(1);
        Some(queued.item)
    }

    /// Remove a specific queued item (scheduler reassignment). Only
    /// queued items can move between hooks; the claimed item cannot.
    pub fn take_queued(&mut self, item_id: &WorkItemId) -> Option<WorkItem> {
        let position = self.queue.iter().position(|q| &q.item.id == item_id)?;
        let queued = self.queue.remove(position);
        self.stats.queued = self.stats.queued.saturating_sub(1);
        Some(queued.item)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Queue depth including the claimed item, the scheduler's load
    /// metric.
    pub fn load(&self) -> usize {
        self.queue.len() + usize::from(self.claimed.is_some())
    }

    pub fn queued_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.queue.iter().map(|q| &q.item)
    }

    /// Age of the current claim relative to the most recent sign of
    /// life (heartbeat, or the claim itself).
    pub fn claim_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let claimed_at = self.claimed.as_ref()?.claimed_at?;
        let last_seen = match self.last_heartbeat {
            Some(hb) if hb > claimed_at => hb,
            _ => claimed_at,
        };
        Some(now.signed_duration_since(last_seen))
    }
}

/// Point-in-time view of a hook, read by the monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookSnapshot {
    pub owner: OwnerId,
    pub owner_kind: OwnerKind,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<WorkItemId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stats: HookStats,
}

impl From<&Hook> for HookSnapshot {
    fn from(hook: &Hook) -> Self {
        Self {
            owner: hook.owner.clone(),
            owner_kind: hook.owner_kind,
            queue_depth: hook.queue_depth(),
            current_item: hook.claimed.as_ref().map(|i| i.id.clone()),
            last_heartbeat: hook.last_heartbeat,
            stats: hook.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guild_types::{MoleculeId, OwnerKind, Priority, StepId};

    fn make_item(priority: Priority) -> WorkItem {
        WorkItem::new(
            MoleculeId::new("m1"),
            StepId::generate(),
            priority,
            "work",
        )
    }

    fn make_hook() -> Hook {
        Hook::new(OwnerId::new("w1"), OwnerKind::Worker)
    }

    #[test]
    fn pop_is_priority_then_fifo() {
        let mut hook = make_hook();
        let first_p2 = make_item(Priority::P2);
        let second_p2 = make_item(Priority::P2);
        let late_p0 = make_item(Priority::P0);

        hook.push(first_p2.clone());
        hook.push(second_p2.clone());
        hook.push(late_p0.clone());

        assert_eq!(hook.pop().unwrap().id, late_p0.id);
        assert_eq!(hook.pop().unwrap().id, first_p2.id);
        assert_eq!(hook.pop().unwrap().id, second_p2.id);
        assert!(hook.pop().is_none());
    }

    #[test]
    fn load_counts_the_claim() {
        let mut hook = make_hook();
        hook.push(make_item(Priority::P1));
        assert_eq!(hook.load(), 1);

        hook.claimed = hook.pop();
        assert_eq!(hook.queue_depth(), 0);
        assert_eq!(hook.load(), 1);
    }

    #[test]
    fn take_queued_removes_by_id() {
        let mut hook = make_hook();
        let item = make_item(Priority::P2);
        hook.push(item.clone());
        hook.push(make_item(Priority::P2));

        let taken = hook.take_queued(&item.id).unwrap();
        assert_eq!(taken.id, item.id);
        assert_eq!(hook.queue_depth(), 1);
        assert!(hook.take_queued(&item.id).is_none());
    }

    #[test]
    fn claim_age_prefers_heartbeat() {
        let mut hook = make_hook();
        let mut item = make_item(Priority::P2);
        let now = Utc::now();
        item.claimed_at = Some(now - chrono::Duration::seconds(600));
        hook.claimed = Some(item);
        assert!(hook.claim_age(now).unwrap() >= chrono::Duration::seconds(600));

        hook.last_heartbeat = Some(now - chrono::Duration::seconds(30));
        assert_eq!(hook.claim_age(now).unwrap(), chrono::Duration::seconds(30));
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut hook = make_hook();
        hook.push(make_item(Priority::P3));
        let snapshot = HookSnapshot::from(&hook);
        assert_eq!(snapshot.queue_depth, 1);
        assert!(snapshot.current_item.is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn priority_strategy() -> impl Strategy<Value = Priority> {
            prop_oneof![
                Just(Priority::P0),
                Just(Priority::P1),
                Just(Priority::P2),
                Just(Priority::P3),
            ]
        }

        proptest! {
            /// P0 items always pop before P1-P3 regardless of arrival
            /// order, and within a priority arrival order holds.
            #[test]
            fn pops_are_priority_then_fifo(priorities in proptest::collection::vec(priority_strategy(), 1..40)) {
                let mut hook = make_hook();
                for (i, priority) in priorities.iter().enumerate() {
                    let mut item = make_item(*priority);
                    item.instruction = format!("arrival-{i}");
                    hook.push(item);
                }

                let mut popped = Vec::new();
                while let Some(item) = hook.pop() {
                    popped.push(item);
                }
                prop_assert_eq!(popped.len(), priorities.len());

                for window in popped.windows(2) {
                    prop_assert!(window[0].priority <= window[1].priority);
                    if window[0].priority == window[1].priority {
                        // FIFO within a priority: arrival tags ascend.
                        let first: usize = window[0].instruction["arrival-".len()..].parse().unwrap();
                        let second: usize = window[1].instruction["arrival-".len()..].parse().unwrap();
                        prop_assert!(first < second);
                    }
                }
            }
        }
    }
}
