//! Immutable, sequenced facts recorded in the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::{EventKind, StepStatus};

/// A persisted event. Created exactly once per fact; never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    /// Per-run, gap-free, starting at 1.
    pub sequence: u64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Attempt number recorded on `step_complete` events.
    pub fn attempt(&self) -> Option<u32> {
        self.metadata
            .get("attempt")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// True if this event proves `step_id` reached `status` on `attempt`.
    pub fn proves_step(&self, step_id: &str, status: StepStatus, attempt: u32) -> bool {
        self.kind == EventKind::StepComplete
            && self.step_id.as_deref() == Some(step_id)
            && self.status.as_deref() == Some(status.as_str())
            && self.attempt() == Some(attempt)
    }
}

/// An event before the log assigns its id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub phase: Option<String>,
    pub step_id: Option<String>,
    pub status: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NewEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            phase: None,
            step_id: None,
            status: None,
            metadata: Map::new(),
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn step(mut self, step_id: impl Into<String>, status: StepStatus) -> Self {
        self.step_id = Some(step_id.into());
        self.status = Some(status.as_str().to_string());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Stable event id for a sequence number (`evt-000042`).
pub fn event_id_for(sequence: u64) -> String {
    format!("evt-{sequence:06}")
}

/// Inverse of [`event_id_for`].
pub fn parse_event_id(event_id: &str) -> Option<u64> {
    event_id
        .strip_prefix("evt-")
        .and_then(|digits| digits.parse().ok())
        .filter(|sequence| *sequence > 0)
}
