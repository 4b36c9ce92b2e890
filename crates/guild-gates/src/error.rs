//! Gate errors

use guild_ledger::LedgerError;
use guild_storage::StorageError;
use guild_types::{GateId, SubmissionId};
use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate not found: {0}")]
    GateNotFound(GateId),

    #[error("submission not found: {0}")]
    SubmissionNotFound(SubmissionId),

    #[error("invalid submission state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
