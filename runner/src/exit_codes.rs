//! Stable process exit codes for storyrunner commands.
//!
//! Engine failures pass the engine's own exit code through, so these are
//! only the codes the runner chooses itself.

/// Command succeeded or every story completed.
pub const OK: i32 = 0;
/// Validation, precondition or engine failure without a more specific code.
pub const FAILURE: i32 = 1;
/// Interrupted with Ctrl-C (128 + SIGINT).
pub const USER_ABORT: i32 = 130;
