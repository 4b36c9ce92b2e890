//! Ledger error taxonomy

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-related errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage failure: {0}")]
    Storage(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("hash chain broken at sequence {sequence}")]
    ChainBroken { sequence: u64 },
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}
