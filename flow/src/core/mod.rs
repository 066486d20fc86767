//! Deterministic, pure logic shared by the flow engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod node;
pub mod registry;
pub mod types;
