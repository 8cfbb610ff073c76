//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between core components and the
//! persisted JSON formats. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Completed and failed runs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Lifecycle status of a Phase within a Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }
}

/// Lifecycle status of a Step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Success,
    Failure,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Terminal step statuses must be backed by exactly one event.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failure | StepStatus::Skipped
        )
    }
}

/// Kinds of facts recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,
    WorkflowResumed,
    WorkflowPaused,
    WorkflowComplete,
    WorkflowFailed,
    PhaseStart,
    PhaseRetry,
    PhaseComplete,
    PhaseFailed,
    PhaseSkipped,
    StepComplete,
    ApprovalGranted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStart => "workflow_start",
            EventKind::WorkflowResumed => "workflow_resumed",
            EventKind::WorkflowPaused => "workflow_paused",
            EventKind::WorkflowComplete => "workflow_complete",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::PhaseStart => "phase_start",
            EventKind::PhaseRetry => "phase_retry",
            EventKind::PhaseComplete => "phase_complete",
            EventKind::PhaseFailed => "phase_failed",
            EventKind::PhaseSkipped => "phase_skipped",
            EventKind::StepComplete => "step_complete",
            EventKind::ApprovalGranted => "approval_granted",
        }
    }
}

/// Configured autonomy level for phase-boundary gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyLevel {
    DryRun,
    Assisted,
    #[default]
    Guarded,
    Autonomous,
}

/// Where a gate sits relative to its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePoint {
    Before,
    After,
}

impl GatePoint {
    pub fn as_str(self) -> &'static str {
        match self {
            GatePoint::Before => "before",
            GatePoint::After => "after",
        }
    }
}

/// Result of a single guard check.
///
/// `Fail` always carries a human-readable reason; callers surface it verbatim
/// in pause/failure reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Pass,
    Fail { reason: String },
}

impl GuardVerdict {
    pub fn fail(reason: impl Into<String>) -> Self {
        GuardVerdict::Fail {
            reason: reason.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GuardVerdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        let json = serde_json::to_string(&RunStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&EventKind::StepComplete).expect("serialize");
        assert_eq!(json, "\"step_complete\"");
    }

    #[test]
    fn autonomy_level_uses_kebab_case() {
        let level: AutonomyLevel = serde_json::from_str("\"dry-run\"").expect("parse");
        assert_eq!(level, AutonomyLevel::DryRun);
        assert_eq!(AutonomyLevel::default(), AutonomyLevel::Guarded);
    }

    #[test]
    fn terminal_classification() {
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(PhaseStatus::Skipped.is_terminal());
    }
}
