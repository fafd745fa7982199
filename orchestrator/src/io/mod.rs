//! Filesystem, process, and clock-bound I/O for the orchestrator.

pub mod audit;
pub mod config;
pub mod context;
pub mod evaluator;
pub mod gateway;
pub mod init;
pub mod process;
pub mod prompt;
pub mod store;
