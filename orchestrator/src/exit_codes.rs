//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded, or a cycle produced an instruction.
pub const OK: i32 = 0;
/// Command failed due to invalid layout, config, arguments, or other errors.
pub const INVALID: i32 = 1;
/// Every task in the graph is completed.
pub const COMPLETE: i32 = 2;
/// No task can proceed this cycle; the report says why.
pub const BLOCKED: i32 = 3;
/// A session-level error halted the session (structural graph error or
/// exhausted safety limit).
pub const HALTED: i32 = 4;
