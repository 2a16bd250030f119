//! Stable exit codes for autopilot CLI commands.

/// Every feature finished without error (done or waiting on a human), or all gates passed.
pub const OK: i32 = 0;
/// A run ended in error, a gate failed, or configuration/state machine access failed.
pub const ERROR: i32 = 1;
/// Invalid command line.
pub const USAGE: i32 = 2;
