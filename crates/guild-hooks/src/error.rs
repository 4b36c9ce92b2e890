//! Hook errors

use guild_ledger::LedgerError;
use guild_storage::StorageError;
use guild_types::{OwnerId, WorkItemId};
use thiserror::Error;

pub type HookResult<T> = Result<T, HookError>;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook not found for owner {0}")]
    HookNotFound(OwnerId),

    #[error("work item not found: {0}")]
    ItemNotFound(WorkItemId),

    #[error("owner {0} already holds a claimed item")]
    ClaimConflict(OwnerId),

    #[error("invalid hook state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
