//! I/O for orchestrator commands: persistence, git, processes and signals.

pub mod approvals;
pub mod config;
pub mod event_log;
pub mod evidence;
pub mod executor;
pub mod fs_util;
pub mod git;
pub mod init;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod session;
pub mod state_store;
