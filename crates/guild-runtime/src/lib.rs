//! Guild runtime
//!
//! The assembly point and the two process-wide drivers:
//!
//! - [`Guild`] wires every subsystem together at startup (ledger,
//!   storage, org, hooks, channels, gates, contracts, molecule
//!   engine, scheduler) and exposes the caller facade.
//! - [`Executor`] drives the corporation in cycles, tier by tier,
//!   refreshing hook state between tiers so work delegated upstream
//!   is visible downstream within the same cycle.
//! - [`Monitor`] reads heartbeats, queue depths, and molecule
//!   progress and raises health alerts. It observes; it never
//!   mutates.
//!
//! External collaborators (the language model, document stores,
//! entity graphs, learning, skills) are narrow traits in
//! [`collaborators`]; the runtime owns no intelligence of its own.

#![deny(unsafe_code)]

pub mod behavior;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod guild;
pub mod monitor;
pub mod telemetry;
pub mod testing;

pub use behavior::{AgentBehavior, ManagerBehavior, WorkerBehavior};
pub use collaborators::{
    Collaborators, EntityGraph, KnowledgeStore, LearningSink, LlmBackend, LlmError, LlmResponse,
    SkillRegistry,
};
pub use config::{MonitorThresholds, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use executor::{CycleReport, Executor};
pub use guild::{Core, Guild};
pub use monitor::{HealthAlert, MetricsSnapshot, Monitor, Severity};
