//! The Guild ledger: append-only, content-addressed event log
//!
//! Every state change in the system records a ledger entry **before**
//! the change becomes externally visible (write-ahead discipline). The
//! ledger is the authoritative history: all other stores can be
//! rebuilt from it by replaying entries in sequence order.
//!
//! # Guarantees
//!
//! - Entries are durable (fsynced) before `append` returns.
//! - Sequence numbers are gap-free and strictly monotonic, starting
//!   at 1.
//! - Each entry carries a blake3 content hash and the hash of its
//!   predecessor, so truncation and tampering are detectable with
//!   [`Ledger::verify_chain`].
//! - Reads never observe partial writes: the recovery scan stops at
//!   the first entry whose hash does not verify.

#![deny(unsafe_code)]

pub mod entry;
pub mod error;
pub mod ledger;
pub mod storage;

pub use entry::{EntityKind, LedgerEntry};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{ChainReport, Ledger, LedgerQuery};
pub use storage::{FsLedgerStorage, LedgerStorage, MemoryLedgerStorage};
