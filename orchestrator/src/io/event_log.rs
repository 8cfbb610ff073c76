//! Append-only, sequence-numbered event log (`runs/<run_id>/events/`).
//!
//! One JSON file per event named by its zero-padded sequence. Appends hold an
//! exclusive `fs2` lock on `events/.lock`, so two processes mistakenly driving
//! the same run can never interleave or reuse a sequence number. Event files
//! are published with `hard_link`, which refuses to overwrite an existing
//! file: an event, once written, is never edited.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, instrument};

use crate::core::event::{Event, NewEvent, event_id_for, parse_event_id};
use crate::io::fs_util::sync_dir;

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct EventLog {
    run_id: String,
    dir: PathBuf,
}

impl EventLog {
    pub fn new(run_id: &str, dir: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            dir: dir.to_path_buf(),
        }
    }

    /// Append one event and return it with its assigned id and sequence.
    #[instrument(skip_all, fields(run_id = %self.run_id, kind = event.kind.as_str()))]
    pub fn append(&self, event: NewEvent) -> Result<Event> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create events dir {}", self.dir.display()))?;
        let _lock = AppendLock::acquire(&self.dir.join(LOCK_FILE))?;

        let sequence = self.last_sequence()? + 1;
        let event = Event {
            event_id: event_id_for(sequence),
            sequence,
            run_id: self.run_id.clone(),
            kind: event.kind,
            phase: event.phase,
            step_id: event.step_id,
            status: event.status,
            metadata: event.metadata,
            timestamp: Utc::now(),
        };

        let mut buf = serde_json::to_vec_pretty(&event).context("serialize event")?;
        buf.push(b'\n');

        let final_path = self.event_path(sequence);
        let tmp_path = self.dir.join(format!(".{sequence:06}.json.tmp"));
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("create temp event {}", tmp_path.display()))?;
            tmp.write_all(&buf)
                .with_context(|| format!("write temp event {}", tmp_path.display()))?;
            tmp.sync_all()
                .with_context(|| format!("sync temp event {}", tmp_path.display()))?;
        }
        let linked = fs::hard_link(&tmp_path, &final_path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "event {} already exists; refusing to overwrite",
                    final_path.display()
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("publish event {}", final_path.display()));
            }
        }
        sync_dir(&self.dir)?;

        debug!(event_id = %event.event_id, sequence, "event appended");
        Ok(event)
    }

    /// All events in sequence order.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        self.read_since(0)
    }

    /// Events with `sequence > after`, in order.
    pub fn read_since(&self, after: u64) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for sequence in self.list_sequences()? {
            if sequence <= after {
                continue;
            }
            events.push(self.read_event(sequence)?);
        }
        Ok(events)
    }

    /// Look up an event by id. Returns `None` if it does not exist.
    pub fn get(&self, event_id: &str) -> Result<Option<Event>> {
        let Some(sequence) = parse_event_id(event_id) else {
            return Ok(None);
        };
        if !self.event_path(sequence).exists() {
            return Ok(None);
        }
        self.read_event(sequence).map(Some)
    }

    /// Highest sequence on disk (0 when empty).
    pub fn last_sequence(&self) -> Result<u64> {
        Ok(self.list_sequences()?.last().copied().unwrap_or(0))
    }

    fn read_event(&self, sequence: u64) -> Result<Event> {
        let path = self.event_path(sequence);
        let contents =
            fs::read(&path).with_context(|| format!("read event {}", path.display()))?;
        let event: Event = serde_json::from_slice(&contents)
            .with_context(|| format!("parse event {}", path.display()))?;
        if event.sequence != sequence || event.event_id != event_id_for(sequence) {
            return Err(anyhow!(
                "event file {} records sequence {} ({})",
                path.display(),
                event.sequence,
                event.event_id
            ));
        }
        Ok(event)
    }

    fn list_sequences(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("list events {}", self.dir.display()));
            }
        };
        let mut sequences = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list events {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(sequence) = stem.parse::<u64>() {
                sequences.push(sequence);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn event_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{sequence:06}.json"))
    }
}

/// Exclusive advisory lock held for the duration of one append.
struct AppendLock {
    file: File,
}

impl AppendLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open event lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for AppendLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EventKind, StepStatus};

    fn log_in(temp: &tempfile::TempDir) -> EventLog {
        EventLog::new("run-1", &temp.path().join("events"))
    }

    #[test]
    fn append_assigns_gap_free_sequences() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = log_in(&temp);

        let first = log.append(NewEvent::new(EventKind::WorkflowStart)).expect("append");
        let second = log
            .append(
                NewEvent::new(EventKind::StepComplete)
                    .phase("build")
                    .step("a", StepStatus::Success)
                    .meta("attempt", 1),
            )
            .expect("append");

        assert_eq!(first.sequence, 1);
        assert_eq!(second.event_id, "evt-000002");
        let all = log.read_all().expect("read");
        assert_eq!(all, vec![first, second.clone()]);
        assert_eq!(log.get("evt-000002").expect("get"), Some(second));
        assert_eq!(log.get("evt-000009").expect("get"), None);
        assert!(temp.path().join("events/000002.json").exists());
    }

    #[test]
    fn read_since_skips_earlier_events_and_ignores_stray_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = log_in(&temp);
        for _ in 0..3 {
            log.append(NewEvent::new(EventKind::PhaseStart).phase("build"))
                .expect("append");
        }
        fs::write(temp.path().join("events/notes.txt"), "x").expect("write");

        let tail = log.read_since(1).expect("read");
        let sequences: Vec<u64> = tail.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn empty_log_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = log_in(&temp);
        assert!(log.read_all().expect("read").is_empty());
        assert_eq!(log.last_sequence().expect("last"), 0);
    }

    #[test]
    fn renamed_event_file_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = log_in(&temp);
        log.append(NewEvent::new(EventKind::WorkflowStart)).expect("append");
        fs::rename(
            temp.path().join("events/000001.json"),
            temp.path().join("events/000002.json"),
        )
        .expect("rename");

        let err = log.read_all().expect_err("mismatch");
        assert!(err.to_string().contains("records sequence 1"));
    }

    #[test]
    fn concurrent_appends_never_reuse_sequences() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("events");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = EventLog::new("run-1", &dir);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        log.append(NewEvent::new(EventKind::PhaseStart)).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let sequences: Vec<u64> = log_in(&temp)
            .read_all()
            .expect("read")
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    }
}
