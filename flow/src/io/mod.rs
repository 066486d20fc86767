//! I/O helpers for flow commands.

pub mod archive;
pub mod change_detection;
pub mod config;
pub mod dir_hash;
pub mod nodes;
pub mod operator;
pub mod outputs;
pub mod process;
pub mod run_log;
pub mod snapshot;
