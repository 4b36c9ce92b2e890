//! Scheduler errors

use guild_hooks::HookError;
use guild_ledger::LedgerError;
use guild_molecule::MoleculeError;
use guild_org::OrgError;
use guild_types::StepId;
use thiserror::Error;

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("step {0} is not ready: dependencies unmet")]
    NotReady(StepId),

    #[error("no registered agent can satisfy: {0}")]
    CapabilityMismatch(String),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Molecule(#[from] MoleculeError),

    #[error(transparent)]
    Org(#[from] OrgError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
