//! Sequential flow execution engine for a personal-finance data pipeline.
//!
//! Named nodes (sync, match, split, apply, manual steps) declare their
//! dependencies and their own change detection. The engine decides which
//! nodes are stale, propagates staleness downstream, orders the result
//! topologically, and runs each node between a pre- and post-execution
//! snapshot of its output directory. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (node contract, registry,
//!   dependency graph). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, subprocesses, change
//!   detection caches, hashing, snapshots, archives, run logs).
//!
//! Orchestration modules ([`engine`], [`plan`], [`run`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod run;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
