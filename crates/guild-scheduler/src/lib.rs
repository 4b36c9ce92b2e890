//! Work scheduler: capability-matched, load-balanced assignment
//!
//! The scheduler turns ready molecule steps into placed work items:
//!
//! 1. **Dependency resolution** — items whose step is not ready are
//!    rejected with `NotReady`.
//! 2. **Capability matching** — candidates are the registered agents
//!    whose capability set covers the item's requirements (and whose
//!    tier matches, when one is required).
//! 3. **Load balancing** — among candidates, the lightest queue
//!    (including the claimed item) wins; ties go to the agent whose
//!    last assignment is oldest, then to the lexicographically
//!    smallest agent id.
//! 4. **Placement** — the item lands in the chosen agent's hook at
//!    its priority, with a ledger entry.
//!
//! Items with no candidate park in a pending-assignments queue and
//! are retried whenever the agent inventory changes or `rebalance`
//! runs.

#![deny(unsafe_code)]

pub mod error;
pub mod scheduler;

pub use error::{ScheduleError, ScheduleResult};
pub use scheduler::{ScheduleOutcome, WorkScheduler};
