//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! snapshots and return deterministic outputs suitable for tests.

pub mod authenticity;
pub mod budget;
pub mod chain;
pub mod context_pack;
pub mod decision;
pub mod error;
pub mod escalation;
pub mod evidence;
pub mod graph;
pub mod invariants;
pub mod manifest;
pub mod policy;
pub mod requirements;
pub mod selector;
pub mod skeleton;
pub mod state_update;
pub mod types;
pub mod xref;
