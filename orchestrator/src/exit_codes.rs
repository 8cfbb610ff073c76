//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; a driven run reached `completed`.
pub const OK: i32 = 0;
/// Invalid plan/config/arguments or any other unclassified error.
pub const INVALID: i32 = 1;
/// The run is `paused` and can be continued with `orchestrator resume`.
pub const PAUSED: i32 = 2;
/// The run is `failed`.
pub const FAILED: i32 = 3;
/// Persisted state was tampered with or disagrees with the event log.
pub const TAMPERED: i32 = 4;
