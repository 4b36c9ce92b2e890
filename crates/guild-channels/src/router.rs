//! The channel router
//!
//! Validates routing rules against the org hierarchy, persists
//! message history per lane, and tracks delivery state. A violation
//! fails fast and never persists anything.

use crate::message::{ChannelKind, Message, MessageStatus};
use crate::{ChannelError, ChannelResult};
use chrono::Utc;
use guild_ledger::{EntityKind, Ledger};
use guild_org::OrgRegistry;
use guild_storage::{RecordKind, RecordStore};
use guild_types::{AgentId, MessageId, Priority};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct RouterState {
    messages: HashMap<MessageId, Message>,
    pair_counters: HashMap<(AgentId, AgentId), u64>,
    arrival_counter: u64,
}

/// Routes and stores inter-agent messages.
pub struct ChannelRouter {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    org: Arc<OrgRegistry>,
    state: RwLock<RouterState>,
}

impl ChannelRouter {
    /// Open the router, reloading message history from storage.
    pub async fn open(
        ledger: Arc<Ledger>,
        store: Arc<dyn RecordStore>,
        org: Arc<OrgRegistry>,
    ) -> ChannelResult<Self> {
        let mut state = RouterState::default();
        for (_, body) in store.list(RecordKind::Channel).await? {
            let history: Vec<Message> =
                serde_json::from_value(body).map_err(guild_storage::StorageError::from)?;
            for message in history {
                let pair = (message.sender.clone(), message.recipient.clone());
                let counter = state.pair_counters.entry(pair).or_default();
                *counter = (*counter).max(message.pair_sequence);
                state.arrival_counter = state.arrival_counter.max(message.arrival);
                state.messages.insert(message.id.clone(), message);
            }
        }
        Ok(Self {
            ledger,
            store,
            org,
            state: RwLock::new(state),
        })
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Send a message to one or more recipients. One message record is
    /// created per recipient; the returned ids are in recipient order.
    pub async fn send(
        &self,
        sender: &AgentId,
        channel: ChannelKind,
        recipients: &[AgentId],
        subject: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
        in_reply_to: Option<MessageId>,
    ) -> ChannelResult<Vec<MessageId>> {
        if channel == ChannelKind::Broadcast {
            return Err(ChannelError::Routing(
                "broadcast audiences are computed; use broadcast()".to_string(),
            ));
        }
        if recipients.is_empty() {
            return Err(ChannelError::InvalidState("no recipients".to_string()));
        }

        // Validate every route before persisting anything.
        for recipient in recipients {
            self.validate_route(sender, recipient, channel).await?;
        }

        self.deliver_to(sender, channel, recipients, subject.into(), body.into(), priority, in_reply_to)
            .await
    }

    /// Broadcast to the sender's transitive subordinate set.
    pub async fn broadcast(
        &self,
        sender: &AgentId,
        subject: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
    ) -> ChannelResult<Vec<MessageId>> {
        // Existence check; the audience itself needs no validation.
        self.org.get(sender).await?;
        let audience = self.org.subordinates(sender).await;
        if audience.is_empty() {
            return Ok(Vec::new());
        }
        self.deliver_to(
            sender,
            ChannelKind::Broadcast,
            &audience,
            subject.into(),
            body.into(),
            priority,
            None,
        )
        .await
    }

    // ── Inbox and delivery state ─────────────────────────────────────

    /// Unread and undelivered messages for a recipient, in stable
    /// send order per sender.
    pub async fn inbox(&self, recipient: &AgentId) -> Vec<Message> {
        let state = self.state.read().await;
        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|m| &m.recipient == recipient && m.is_pending())
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.arrival);
        messages
    }

    pub async fn get(&self, message_id: &MessageId) -> ChannelResult<Message> {
        let state = self.state.read().await;
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| ChannelError::MessageNotFound(message_id.clone()))
    }

    /// Record delivery. Idempotent once delivered or read.
    pub async fn mark_delivered(&self, message_id: &MessageId) -> ChannelResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get(message_id)
            .ok_or_else(|| ChannelError::MessageNotFound(message_id.clone()))?;
        if message.status != MessageStatus::Pending {
            return Ok(());
        }

        self.ledger
            .append(
                message.recipient.as_str(),
                EntityKind::Message,
                message_id.as_str(),
                "message_delivered",
                serde_json::json!({}),
                None,
            )
            .await?;

        let channel = message.channel;
        if let Some(message) = state.messages.get_mut(message_id) {
            message.status = MessageStatus::Delivered;
            message.delivered_at = Some(Utc::now());
        }
        self.persist_channel(&state, channel).await
    }

    /// Record that the recipient has read the message.
    pub async fn mark_read(&self, message_id: &MessageId) -> ChannelResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get(message_id)
            .ok_or_else(|| ChannelError::MessageNotFound(message_id.clone()))?;
        if message.status == MessageStatus::Read {
            return Ok(());
        }
        if message.status == MessageStatus::Failed {
            return Err(ChannelError::InvalidState(
                "failed messages cannot be read".to_string(),
            ));
        }

        self.ledger
            .append(
                message.recipient.as_str(),
                EntityKind::Message,
                message_id.as_str(),
                "message_read",
                serde_json::json!({}),
                None,
            )
            .await?;

        let channel = message.channel;
        let now = Utc::now();
        if let Some(message) = state.messages.get_mut(message_id) {
            if message.delivered_at.is_none() {
                message.delivered_at = Some(now);
            }
            message.status = MessageStatus::Read;
            message.read_at = Some(now);
        }
        self.persist_channel(&state, channel).await
    }

    /// Full history of one lane, in arrival order.
    pub async fn history(&self, channel: ChannelKind) -> Vec<Message> {
        let state = self.state.read().await;
        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.arrival);
        messages
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Enforce the tier relationship for one sender → recipient route.
    async fn validate_route(
        &self,
        sender: &AgentId,
        recipient: &AgentId,
        channel: ChannelKind,
    ) -> ChannelResult<()> {
        let sender_profile = self.org.get(sender).await?;
        let recipient_profile = self.org.get(recipient).await?;

        let ok = match channel {
            ChannelKind::Downchain => {
                sender_profile.tier.outranks(recipient_profile.tier)
                    && self.org.is_in_chain(sender, recipient).await
            }
            ChannelKind::Upchain => {
                recipient_profile.tier.outranks(sender_profile.tier)
                    && self.org.is_in_chain(recipient, sender).await
            }
            ChannelKind::Peer => {
                sender != recipient && sender_profile.tier == recipient_profile.tier
            }
            ChannelKind::Broadcast => true,
        };

        if !ok {
            return Err(ChannelError::Routing(format!(
                "{} message from {} ({}) to {} ({}) violates routing rules",
                channel, sender, sender_profile.tier, recipient, recipient_profile.tier
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_to(
        &self,
        sender: &AgentId,
        channel: ChannelKind,
        recipients: &[AgentId],
        subject: String,
        body: String,
        priority: Priority,
        in_reply_to: Option<MessageId>,
    ) -> ChannelResult<Vec<MessageId>> {
        let mut state = self.state.write().await;

        let thread_id = match &in_reply_to {
            Some(parent_id) => state
                .messages
                .get(parent_id)
                .map(|parent| parent.thread_id.clone().unwrap_or_else(|| parent.id.clone())),
            None => None,
        };

        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let pair = (sender.clone(), recipient.clone());
            let pair_sequence = {
                let counter = state.pair_counters.entry(pair).or_default();
                *counter += 1;
                *counter
            };
            state.arrival_counter += 1;

            let message = Message {
                id: MessageId::generate(),
                channel,
                sender: sender.clone(),
                recipient: recipient.clone(),
                subject: subject.clone(),
                body: body.clone(),
                priority,
                status: MessageStatus::Pending,
                in_reply_to: in_reply_to.clone(),
                thread_id: thread_id.clone(),
                pair_sequence,
                arrival: state.arrival_counter,
                sent_at: Utc::now(),
                delivered_at: None,
                read_at: None,
            };

            self.ledger
                .append(
                    sender.as_str(),
                    EntityKind::Message,
                    message.id.as_str(),
                    "message_sent",
                    serde_json::json!({
                        "channel": channel,
                        "recipient": recipient,
                        "subject": message.subject,
                        "priority": priority,
                    }),
                    None,
                )
                .await?;

            ids.push(message.id.clone());
            state.messages.insert(message.id.clone(), message);
        }

        self.persist_channel(&state, channel).await?;
        debug!(sender = %sender, %channel, recipients = recipients.len(), "message sent");
        Ok(ids)
    }

    /// Rewrite one lane's history record.
    async fn persist_channel(&self, state: &RouterState, channel: ChannelKind) -> ChannelResult<()> {
        let mut history: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.arrival);
        let body = serde_json::to_value(&history).map_err(guild_storage::StorageError::from)?;
        self.store
            .put(RecordKind::Channel, channel.channel_id(), body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guild_ledger::MemoryLedgerStorage;
    use guild_storage::MemoryRecordStore;
    use guild_types::{AgentProfile, Tier};

    async fn make_router() -> (Arc<OrgRegistry>, ChannelRouter) {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
        let org = Arc::new(OrgRegistry::open(ledger.clone(), store.clone()).await.unwrap());

        org.hire(AgentProfile::new(AgentId::new("ceo"), "CEO", Tier::Executive))
            .await
            .unwrap();
        org.hire(
            AgentProfile::new(AgentId::new("vp-eng"), "VP Eng", Tier::Vp)
                .reporting_to(AgentId::new("ceo")),
        )
        .await
        .unwrap();
        org.hire(
            AgentProfile::new(AgentId::new("vp-sales"), "VP Sales", Tier::Vp)
                .reporting_to(AgentId::new("ceo")),
        )
        .await
        .unwrap();
        org.hire(
            AgentProfile::new(AgentId::new("w1"), "Worker", Tier::Worker)
                .reporting_to(AgentId::new("vp-eng")),
        )
        .await
        .unwrap();

        let router = ChannelRouter::open(ledger, store, org.clone()).await.unwrap();
        (org, router)
    }

    #[tokio::test]
    async fn downchain_requires_chain_of_command() {
        let (_org, router) = make_router().await;

        // ceo → w1 is fine (transitive chain).
        router
            .send(
                &AgentId::new("ceo"),
                ChannelKind::Downchain,
                &[AgentId::new("w1")],
                "directive",
                "ship it",
                Priority::P1,
                None,
            )
            .await
            .unwrap();

        // vp-sales → w1 crosses chains.
        let result = router
            .send(
                &AgentId::new("vp-sales"),
                ChannelKind::Downchain,
                &[AgentId::new("w1")],
                "directive",
                "sell it",
                Priority::P1,
                None,
            )
            .await;
        assert!(matches!(result, Err(ChannelError::Routing(_))));
    }

    #[tokio::test]
    async fn upchain_is_the_symmetric_route() {
        let (_org, router) = make_router().await;
        router
            .send(
                &AgentId::new("w1"),
                ChannelKind::Upchain,
                &[AgentId::new("vp-eng")],
                "status",
                "done",
                Priority::P2,
                None,
            )
            .await
            .unwrap();

        let result = router
            .send(
                &AgentId::new("vp-eng"),
                ChannelKind::Upchain,
                &[AgentId::new("w1")],
                "status",
                "??",
                Priority::P2,
                None,
            )
            .await;
        assert!(matches!(result, Err(ChannelError::Routing(_))));
    }

    #[tokio::test]
    async fn peer_requires_equal_tier() {
        let (_org, router) = make_router().await;
        router
            .send(
                &AgentId::new("vp-eng"),
                ChannelKind::Peer,
                &[AgentId::new("vp-sales")],
                "sync",
                "lunch?",
                Priority::P3,
                None,
            )
            .await
            .unwrap();

        let result = router
            .send(
                &AgentId::new("vp-eng"),
                ChannelKind::Peer,
                &[AgentId::new("w1")],
                "sync",
                "lunch?",
                Priority::P3,
                None,
            )
            .await;
        assert!(matches!(result, Err(ChannelError::Routing(_))));
    }

    #[tokio::test]
    async fn violations_do_not_persist() {
        let (_org, router) = make_router().await;
        let _ = router
            .send(
                &AgentId::new("vp-eng"),
                ChannelKind::Peer,
                &[AgentId::new("w1")],
                "bad",
                "",
                Priority::P3,
                None,
            )
            .await;
        assert!(router.inbox(&AgentId::new("w1")).await.is_empty());
    }

    #[tokio::test]
    async fn inbox_preserves_per_sender_send_order() {
        let (_org, router) = make_router().await;
        let sender = AgentId::new("vp-eng");
        let recipient = [AgentId::new("w1")];
        for i in 0..3 {
            router
                .send(
                    &sender,
                    ChannelKind::Downchain,
                    &recipient,
                    format!("task {i}"),
                    "",
                    Priority::P2,
                    None,
                )
                .await
                .unwrap();
        }

        let inbox = router.inbox(&AgentId::new("w1")).await;
        assert_eq!(inbox.len(), 3);
        let subjects: Vec<_> = inbox
            .iter()
            .filter(|m| m.sender == sender)
            .map(|m| m.subject.clone())
            .collect();
        assert_eq!(subjects, vec!["task 0", "task 1", "task 2"]);
        let sequences: Vec<_> = inbox
            .iter()
            .filter(|m| m.sender == sender)
            .map(|m| m.pair_sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_messages_leave_the_inbox() {
        let (_org, router) = make_router().await;
        let ids = router
            .send(
                &AgentId::new("ceo"),
                ChannelKind::Downchain,
                &[AgentId::new("vp-eng")],
                "welcome",
                "",
                Priority::P2,
                None,
            )
            .await
            .unwrap();

        router.mark_delivered(&ids[0]).await.unwrap();
        assert_eq!(router.inbox(&AgentId::new("vp-eng")).await.len(), 1);

        router.mark_read(&ids[0]).await.unwrap();
        assert!(router.inbox(&AgentId::new("vp-eng")).await.is_empty());

        let message = router.get(&ids[0]).await.unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        assert!(message.read_at.is_some());
    }

    #[tokio::test]
    async fn broadcast_reaches_transitive_subordinates() {
        let (_org, router) = make_router().await;
        let ids = router
            .broadcast(&AgentId::new("ceo"), "all hands", "meeting at 3", Priority::P1)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3); // vp-eng, vp-sales, w1

        assert_eq!(router.inbox(&AgentId::new("w1")).await.len(), 1);
        assert_eq!(router.inbox(&AgentId::new("vp-sales")).await.len(), 1);
    }

    #[tokio::test]
    async fn replies_share_a_thread() {
        let (_org, router) = make_router().await;
        let first = router
            .send(
                &AgentId::new("vp-eng"),
                ChannelKind::Downchain,
                &[AgentId::new("w1")],
                "task",
                "",
                Priority::P2,
                None,
            )
            .await
            .unwrap();
        let reply = router
            .send(
                &AgentId::new("w1"),
                ChannelKind::Upchain,
                &[AgentId::new("vp-eng")],
                "re: task",
                "done",
                Priority::P2,
                Some(first[0].clone()),
            )
            .await
            .unwrap();

        let message = router.get(&reply[0]).await.unwrap();
        assert_eq!(message.in_reply_to, Some(first[0].clone()));
        assert_eq!(message.thread_id, Some(first[0].clone()));
    }

    #[tokio::test]
    async fn messages_survive_restart() {
        let ledger = Arc::new(Ledger::open(Box::new(MemoryLedgerStorage::new())).unwrap());
        let store: Arc<MemoryRecordStore> = Arc::new(MemoryRecordStore::new());
        let org = Arc::new(OrgRegistry::open(ledger.clone(), store.clone()).await.unwrap());
        org.hire(AgentProfile::new(AgentId::new("ceo"), "CEO", Tier::Executive))
            .await
            .unwrap();
        org.hire(
            AgentProfile::new(AgentId::new("vp"), "VP", Tier::Vp).reporting_to(AgentId::new("ceo")),
        )
        .await
        .unwrap();

        {
            let router = ChannelRouter::open(ledger.clone(), store.clone(), org.clone())
                .await
                .unwrap();
            router
                .send(
                    &AgentId::new("ceo"),
                    ChannelKind::Downchain,
                    &[AgentId::new("vp")],
                    "persist me",
                    "",
                    Priority::P2,
                    None,
                )
                .await
                .unwrap();
        }

        let router = ChannelRouter::open(ledger, store, org).await.unwrap();
        let inbox = router.inbox(&AgentId::new("vp")).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].subject, "persist me");
    }
}
