//! Stable exit codes for `quest-runner` commands.

/// Command succeeded; for `run`, the quest completed.
pub const OK: i32 = 0;
/// Invalid input, invalid quest, rejected transition, or an infrastructure error.
pub const INVALID: i32 = 1;
/// `run` ended with a step graph that could make no further progress.
pub const STALLED: i32 = 3;
/// `run` used its whole repair budget without a passing Ward gate.
pub const REPAIR_EXHAUSTED: i32 = 4;
