//! Org registry errors

use guild_ledger::LedgerError;
use guild_storage::StorageError;
use guild_types::AgentId;
use thiserror::Error;

pub type OrgResult<T> = Result<T, OrgError>;

#[derive(Debug, Error)]
pub enum OrgError {
    #[error("agent not found: {0}")]
    NotFound(AgentId),

    #[error("invalid org state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
