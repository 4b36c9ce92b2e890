//! Strongly-typed identifiers for Guild entities
//!
//! All IDs are opaque printable strings wrapped in newtype structs for
//! type safety. Generated IDs carry a short prefix naming the entity
//! kind so they stay readable in ledgers and logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for compact log lines.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier for an agent.
    AgentId,
    "agent"
);
string_id!(
    /// Unique identifier for a molecule (a persistent workflow).
    MoleculeId,
    "mol"
);
string_id!(
    /// Unique identifier for a step within a molecule.
    StepId,
    "step"
);
string_id!(
    /// Unique identifier for a schedulable work item.
    WorkItemId,
    "item"
);
string_id!(
    /// Unique identifier for a message.
    MessageId,
    "msg"
);
string_id!(
    /// Unique identifier for a channel.
    ChannelId,
    "chan"
);
string_id!(
    /// Unique identifier for a gate.
    GateId,
    "gate"
);
string_id!(
    /// Unique identifier for a gate submission.
    SubmissionId,
    "sub"
);
string_id!(
    /// Unique identifier for a gate criterion.
    CriterionId,
    "crit"
);
string_id!(
    /// Unique identifier for a contract.
    ContractId,
    "contract"
);
string_id!(
    /// Unique identifier for a ledger entry.
    EntryId,
    "entry"
);

/// Identifier of a hook owner: an agent or a worker pool.
///
/// Hooks are keyed by owner, and the scheduler may place work on a
/// pool-owned hook as well as an agent-owned one, so the key is its
/// own type rather than an [`AgentId`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<AgentId> for OwnerId {
    fn from(id: AgentId) -> Self {
        Self(id.0)
    }
}

impl From<&AgentId> for OwnerId {
    fn from(id: &AgentId) -> Self {
        Self(id.0.clone())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
