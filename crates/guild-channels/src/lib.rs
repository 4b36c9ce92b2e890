//! Channel system: typed inter-agent messaging
//!
//! Four routing lanes exist, typed by the tier relationship between
//! sender and recipient:
//!
//! - **Downchain** — delegation; sender must outrank the recipient and
//!   the recipient must transitively report to the sender.
//! - **Upchain** — reporting; the symmetric of downchain.
//! - **Peer** — between agents at the same tier.
//! - **Broadcast** — fan-out to the sender's transitive subordinates.
//!
//! Routing rules are enforced at send time and violations never
//! persist. Delivery is at-least-once: messages survive restarts and
//! stay in the recipient's inbox until marked read. Per
//! (sender, recipient) pair, messages appear in the inbox in send
//! order; no ordering holds across senders.

#![deny(unsafe_code)]

pub mod error;
pub mod message;
pub mod router;

pub use error::{ChannelError, ChannelResult};
pub use message::{ChannelKind, Message, MessageStatus};
pub use router::ChannelRouter;
