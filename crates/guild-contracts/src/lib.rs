//! Contract system: measurable completion criteria for molecules
//!
//! Each molecule has at most one contract and vice versa (a 1:1 pair
//! linked by ids). Contracts are versioned: an amendment creates
//! version N+1 referencing its predecessor, and the predecessor is
//! retained immutably with status `amended`. A molecule's contract is
//! always the latest version.
//!
//! Continuous-mode contracts are re-validated on a cadence; a run of
//! consecutive failures past the escalation threshold produces an
//! escalation signal that the runtime routes upchain.

#![deny(unsafe_code)]

pub mod contract;
pub mod error;
pub mod manager;

pub use contract::{
    ContinuousCriterion, Contract, ContractStatus, EscalationSignal, SuccessCriterion,
    ValidationMode, ValidationReport,
};
pub use error::{ContractError, ContractResult};
pub use manager::{ContractManager, ContractSpec};
