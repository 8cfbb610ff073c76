//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod event;
pub mod integrity;
pub mod policy;
pub mod report;
pub mod state;
pub mod transitions;
pub mod types;
