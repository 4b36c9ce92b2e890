//! Guild domain types
//!
//! The vocabulary shared by every Guild subsystem: strongly-typed
//! identifiers, agent profiles and tiers, work-item priorities, RACI
//! assignments, the failure taxonomy recorded on failed steps, and the
//! cooperative cancellation token threaded through long-running
//! operations.
//!
//! This crate carries no behavior beyond constructors and small
//! predicates; the managers that interpret these types live in the
//! subsystem crates.

#![deny(unsafe_code)]

pub mod agent;
pub mod cancel;
pub mod failure;
pub mod ids;
pub mod priority;
pub mod status;

pub use agent::{AgentProfile, OwnerKind, RaciAssignments, Tier};
pub use cancel::{CancelError, CancelToken};
pub use failure::{FailureBead, FailureKind, FailureOutcome};
pub use ids::{
    AgentId, ChannelId, ContractId, CriterionId, EntryId, GateId, MessageId, MoleculeId, OwnerId,
    StepId, SubmissionId, WorkItemId,
};
pub use priority::Priority;
pub use status::{MoleculeStatus, StepStatus, WorkflowKind};
