//! Stable exit codes for quest CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, quest definition or arguments, or an internal failure.
pub const INVALID: i32 = 1;
/// The cycle hit a transient condition (forge unreachable, concurrent writer).
pub const TRANSIENT: i32 = 2;
/// The cycle stopped on remote state that needs the learner's attention.
pub const NEEDS_ATTENTION: i32 = 3;
