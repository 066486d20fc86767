//! Stable exit codes for flow CLI commands.

/// Command succeeded (including runs where every node was skipped).
pub const OK: i32 = 0;
/// Invalid config, unresolved dependencies, cycles, or other setup errors.
pub const INVALID: i32 = 1;
/// A node's `execute` failed; later nodes were not attempted.
pub const NODE_FAILED: i32 = 2;
/// A dependency's output was missing or unusable when a dependent was due.
pub const DEPENDENCY_NOT_READY: i32 = 3;
/// A snapshot or archive could not be written.
pub const ARCHIVE_FAILED: i32 = 4;
