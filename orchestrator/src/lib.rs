//! Evidence-driven task orchestration, one bounded cycle per trigger.
//!
//! The crate keeps a persistent task graph and session on disk, ingests
//! evidence from an external executor, verifies it, and asks an external
//! decision endpoint what to do next. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scheduling, authenticity scoring,
//!   evidence chains, context packing, escalation policy). No I/O.
//! - **[`io`]**: Side-effecting operations (state store, decision gateway,
//!   process execution, audit logs). Isolated behind traits for tests.
//!
//! Orchestration modules ([`cycle`], [`select`], [`validate`], [`status`],
//! [`deps`], [`resume`]) coordinate core logic with I/O to implement CLI commands.

pub mod config;
pub mod core;
pub mod cycle;
pub mod deps;
pub mod escalate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resume;
pub mod select;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
