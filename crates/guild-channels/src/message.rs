//! Messages and channel kinds

use chrono::{DateTime, Utc};
use guild_types::{AgentId, MessageId, Priority};
use serde::{Deserialize, Serialize};

/// The four routing lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Delegation down the hierarchy.
    Downchain,
    /// Reporting up the hierarchy.
    Upchain,
    /// Between agents at the same tier.
    Peer,
    /// Fan-out to the sender's transitive subordinates.
    Broadcast,
}

impl ChannelKind {
    /// Channel record id in storage; one history per lane.
    pub fn channel_id(&self) -> &'static str {
        match self {
            ChannelKind::Downchain => "downchain",
            ChannelKind::Upchain => "upchain",
            ChannelKind::Peer => "peer",
            ChannelKind::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel_id())
    }
}

/// Delivery state of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Delivered,
    Read,
    Failed,
}

/// One message to one recipient. Multi-recipient sends and broadcasts
/// materialize one message per recipient so that per-pair ordering
/// and per-recipient read state stay simple.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: ChannelKind,
    pub sender: AgentId,
    pub recipient: AgentId,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub status: MessageStatus,
    /// Message this replies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    /// Root of the reply thread (the first message's own id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<MessageId>,
    /// Position in the (sender, recipient) send order.
    pub pair_sequence: u64,
    /// Global arrival stamp; stable inbox ordering across senders.
    pub arrival: u64,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// True while the recipient has not read the message.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, MessageStatus::Pending | MessageStatus::Delivered)
    }
}
