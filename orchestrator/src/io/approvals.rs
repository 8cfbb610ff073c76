//! External approval signals for autonomy gates and destructive steps.
//!
//! An approval is a JSON file `approvals/<key>.json` written by an operator
//! (`orchestrator approve`) or any external system. The orchestrator only
//! reads them; consumption is recorded as an `approval_granted` event.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::io::fs_util::{read_json, write_json_atomic};
use crate::plan::validate_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub granted_at: DateTime<Utc>,
}

/// Where approval signals come from.
pub trait ApprovalSource {
    fn lookup(&self, key: &str) -> Result<Option<Approval>>;
}

/// File-backed approvals under `runs/<run_id>/approvals/`.
#[derive(Debug, Clone)]
pub struct FileApprovalStore {
    dir: PathBuf,
}

impl FileApprovalStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Record an approval for `key`.
    pub fn grant(&self, key: &str, approved_by: Option<String>, note: Option<String>) -> Result<Approval> {
        validate_id(key).map_err(|err| anyhow::anyhow!("approval key: {err}"))?;
        let approval = Approval {
            key: key.to_string(),
            approved_by,
            note,
            granted_at: Utc::now(),
        };
        write_json_atomic(&self.path(key), &approval)?;
        info!(key, "approval granted");
        Ok(approval)
    }
}

impl ApprovalSource for FileApprovalStore {
    fn lookup(&self, key: &str) -> Result<Option<Approval>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalWait {
    Granted(Approval),
    /// No approval arrived within the wait budget.
    Pending,
    /// The wait was cancelled by the operator.
    Cancelled,
}

/// Wait synchronously for `key` to be approved.
///
/// Checks once immediately, then polls until `wait` elapses or `cancel` is set.
pub fn wait_for_approval(
    source: &dyn ApprovalSource,
    key: &str,
    wait: Duration,
    poll: Duration,
    cancel: &AtomicBool,
) -> Result<ApprovalWait> {
    // A wait too long to represent has no deadline.
    let deadline = Instant::now().checked_add(wait);
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(ApprovalWait::Cancelled);
        }
        if let Some(approval) = source.lookup(key)? {
            return Ok(ApprovalWait::Granted(approval));
        }
        let now = Instant::now();
        let nap = match deadline {
            Some(deadline) if now >= deadline => {
                debug!(key, "approval not granted within wait budget");
                return Ok(ApprovalWait::Pending);
            }
            Some(deadline) => poll.min(deadline - now),
            None => poll,
        };
        thread::sleep(nap);
    }
}
