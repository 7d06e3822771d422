//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod readiness;
pub mod transition;
pub mod types;
pub mod upsert;
pub mod ward;
