//! Stable exit codes for gatekeeper CLI commands.

/// Command succeeded; `run` produced a final answer.
pub const OK: i32 = 0;
/// Invalid policy, trajectory or arguments, or any other fatal error.
pub const INVALID: i32 = 1;
/// Requirements contradicted each other.
pub const CONFLICT: i32 = 2;
/// `run` hit the step budget before a final answer.
pub const INCOMPLETE: i32 = 3;
/// `run` was cancelled.
pub const CANCELLED: i32 = 4;
