//! Multi-phase workflow orchestration engine.
//!
//! A run executes a declarative plan (ordered phases of steps) while refusing
//! to record progress it cannot prove. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transition rules, integrity
//!   validation, retry and autonomy policy, reports). No I/O.
//! - **[`io`]**: Side-effecting operations (event log, state store, git,
//!   process execution, approvals). Isolated to enable fakes in tests.
//!
//! Orchestration modules ([`start`], [`resume`], [`looping`], [`step`],
//! [`status`], [`validate`]) coordinate core logic with I/O to implement the
//! CLI commands.

pub mod core;
pub mod engine;
pub mod errors;
pub mod exit_codes;
pub mod guards;
pub mod io;
pub mod logging;
pub mod looping;
pub mod plan;
pub mod resume;
pub mod start;
pub mod status;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
