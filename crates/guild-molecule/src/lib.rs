//! Molecule engine: persistent, resumable workflows
//!
//! A molecule is a durable workflow: named steps with declared
//! dependencies, a topology that may expand or loop those steps, a
//! RACI assignment with exactly one accountable agent, economics with
//! an optional cost cap, and append-only checkpoints for crash
//! recovery.
//!
//! # Topologies
//!
//! - **Linear** — steps run as their dependencies complete.
//! - **Swarm** — scatter → critique → converge: N parallel attempts,
//!   optional critique rounds, one convergence step.
//! - **Persistent-retry** — one logical step in a retry loop, with
//!   failures fed back as context and explicit exit criteria.
//! - **Composite** — ordered phases, each materialized as a child
//!   molecule, with configurable escalation on phase failure.
//! - **Continuous / Hybrid** — the step graph re-runs at an interval
//!   until exit conditions or an iteration bound.
//!
//! The engine serializes all mutations per molecule, writes a ledger
//! entry before every state change becomes visible, and persists each
//! molecule as one record (`molecules/active`, moving to
//! `molecules/completed` on terminal status).

#![deny(unsafe_code)]

pub mod engine;
pub mod error;
pub mod molecule;
pub mod spec;
pub mod step;
pub mod topology;

pub use engine::MoleculeEngine;
pub use error::{MoleculeError, MoleculeResult};
pub use molecule::{Economics, Molecule, SwarmStepSets};
pub use spec::{MoleculeSpec, StepSpec};
pub use step::{Checkpoint, Step};
pub use topology::{
    CompositeConfig, ConvergenceStrategy, LoopConfig, PhaseFailureAction, PhaseSpec, RetryConfig,
    SwarmConfig, TopologyConfig,
};
