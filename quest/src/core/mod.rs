//! Deterministic, pure logic shared by the quest orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! observations and return deterministic decisions suitable for tests.

pub mod conflict;
pub mod identity;
pub mod machine;
pub mod types;
