//! Agent registry and reporting hierarchy
//!
//! The org registry owns the set of hired agents and the
//! reports-to graph between them. Channel routing and the scheduler
//! both read hierarchy relationships from here; hiring and
//! termination write ledger entries before anything else observes the
//! change.

#![deny(unsafe_code)]

pub mod error;
pub mod registry;

pub use error::{OrgError, OrgResult};
pub use registry::OrgRegistry;
