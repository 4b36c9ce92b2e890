//! Gate system: quality checkpoints
//!
//! A gate is an ordered list of criteria plus an auto-approval policy.
//! Work passes a gate by submission: the submitter attaches artifacts,
//! each criterion's auto-check (if it has one) runs against them, and
//! the policy decides whether the submission auto-approves or waits
//! for a manual decision.
//!
//! Submission statuses move forward only: a submission that reached
//! `approved` or `rejected` never changes again. Rejection does not
//! block further submissions against the same gate and step; every
//! submission is independent.

#![deny(unsafe_code)]

pub mod check;
pub mod error;
pub mod gate;
pub mod manager;

pub use error::{GateError, GateResult};
pub use gate::{
    AutoApprovalPolicy, Criterion, CriterionResult, Gate, Submission, SubmissionStatus,
};
pub use manager::GateManager;
