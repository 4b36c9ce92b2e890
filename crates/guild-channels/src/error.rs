//! Channel errors

use guild_ledger::LedgerError;
use guild_org::OrgError;
use guild_storage::StorageError;
use guild_types::MessageId;
use thiserror::Error;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("routing violation: {0}")]
    Routing(String),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("invalid message state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Org(#[from] OrgError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
