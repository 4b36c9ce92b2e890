//! Record persistence for Guild
//!
//! Every durable entity (molecules, hooks, channels, gates,
//! submissions, contracts, agent profiles, monitor snapshots) persists
//! as a single self-describing JSON record behind the [`RecordStore`]
//! trait. Two backends exist: [`FsRecordStore`], the production
//! filesystem layout, and [`MemoryRecordStore`], a deterministic test
//! double.
//!
//! The ledger does not go through this crate; it has its own
//! append-only storage in `guild-ledger`.

#![deny(unsafe_code)]

pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use fs::FsRecordStore;
pub use memory::MemoryRecordStore;
pub use traits::{RecordEnvelope, RecordKind, RecordStore, SCHEMA_VERSION};
