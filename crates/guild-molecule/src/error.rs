//! Molecule engine errors

use guild_gates::GateError;
use guild_ledger::LedgerError;
use guild_storage::StorageError;
use guild_types::{MoleculeId, StepId};
use thiserror::Error;

pub type MoleculeResult<T> = Result<T, MoleculeError>;

#[derive(Debug, Error)]
pub enum MoleculeError {
    #[error("molecule not found: {0}")]
    NotFound(MoleculeId),

    #[error("step not found: {0}")]
    StepNotFound(StepId),

    #[error("invalid molecule state: {0}")]
    InvalidState(String),

    #[error("step dependencies do not form a DAG: {0}")]
    NotADag(String),

    #[error("cost cap exceeded: spent {spent:.2} of cap {cap:.2}")]
    CostCapExceeded { spent: f64, cap: f64 },

    #[error("retries exhausted for step {0}")]
    RetriesExhausted(StepId),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
