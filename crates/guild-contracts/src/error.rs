//! Contract errors

use guild_ledger::LedgerError;
use guild_storage::StorageError;
use guild_types::ContractId;
use thiserror::Error;

pub type ContractResult<T> = Result<T, ContractError>;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract not found: {0}")]
    NotFound(ContractId),

    #[error("invalid contract state: {0}")]
    InvalidState(String),

    #[error("criterion index {0} out of range")]
    CriterionOutOfRange(usize),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
