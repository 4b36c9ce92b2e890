//! Runtime error aggregation

use guild_channels::ChannelError;
use guild_contracts::ContractError;
use guild_gates::GateError;
use guild_hooks::HookError;
use guild_ledger::LedgerError;
use guild_molecule::MoleculeError;
use guild_org::OrgError;
use guild_scheduler::ScheduleError;
use guild_storage::StorageError;
use guild_types::CancelError;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Any error the runtime surfaces to its caller.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Org(#[from] OrgError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Molecule(#[from] MoleculeError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cancelled(#[from] CancelError),

    #[error("language model backend failure: {0}")]
    Llm(String),

    #[error("invalid runtime state: {0}")]
    InvalidState(String),
}
