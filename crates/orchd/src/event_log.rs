//! Append-only JSONL event logs and atomic JSON snapshots.
//!
//! The log is the ground truth for a run; `state.json` is a cache that may
//! trail the log after a crash. [`replay_run`] brings a snapshot up to date.

use chrono::{DateTime, Utc};
use orch_core::events::{Event, EventKind};
use orch_core::types::Run;
use serde::de::DeserializeOwned;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed event at {path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("event log {path} is out of sequence: expected seq {expected}, found {found}")]
    Sequence {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One `events.jsonl` file with gapless `seq` numbering from 1.
///
/// Appends hold an exclusive lock on the file. When another writer grew the
/// file since this handle last wrote, `seq` is re-derived from disk first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    path: PathBuf,
    source: String,
    next_seq: u64,
    known_len: u64,
}

impl EventLog {
    /// Open or create the log. A torn final line left by a crash is cut off.
    pub fn open(path: impl Into<PathBuf>, source: impl Into<String>) -> Result<Self, EventLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| EventLogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        truncate_torn_tail(&path)?;
        let next_seq = next_seq_on_disk(&path)?;
        let known_len = file_len(&path)?;
        Ok(Self {
            path,
            source: source.into(),
            next_seq,
            known_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn append(
        &mut self,
        kind: EventKind,
        at: DateTime<Utc>,
        correlation_id: Option<String>,
    ) -> Result<Event, EventLogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| EventLogError::Append {
                path: self.path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&file).map_err(|source| EventLogError::Append {
            path: self.path.clone(),
            source,
        })?;
        let appended = self.append_locked(&mut file, kind, at, correlation_id);
        if let Err(err) = FileExt::unlock(&file) {
            warn!(path = %self.path.display(), error = %err, "failed to release event log lock");
        }
        appended
    }

    fn append_locked(
        &mut self,
        file: &mut File,
        kind: EventKind,
        at: DateTime<Utc>,
        correlation_id: Option<String>,
    ) -> Result<Event, EventLogError> {
        let len = file
            .metadata()
            .map_err(|source| EventLogError::Read {
                path: self.path.clone(),
                source,
            })?
            .len();
        if len != self.known_len {
            self.next_seq = next_seq_on_disk(&self.path)?;
            debug!(path = %self.path.display(), next_seq = self.next_seq, "event log grew under another writer");
        }

        let event = Event {
            seq: self.next_seq,
            timestamp: at,
            kind,
            source: self.source.clone(),
            correlation_id,
        };
        let mut line =
            serde_json::to_string(&event).map_err(|source| EventLogError::Serialize { source })?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|source| EventLogError::Append {
                path: self.path.clone(),
                source,
            })?;
        self.next_seq += 1;
        self.known_len = len + line.len() as u64;
        Ok(event)
    }

    pub fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        read_events(&self.path)
    }
}

/// Every event in `path`, checked for gapless ordering. A missing file is empty.
pub fn read_events(path: &Path) -> Result<Vec<Event>, EventLogError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(EventLogError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut events = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event =
            serde_json::from_str(line).map_err(|source| EventLogError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
        let expected = events.len() as u64 + 1;
        if event.seq != expected {
            return Err(EventLogError::Sequence {
                path: path.to_path_buf(),
                expected,
                found: event.seq,
            });
        }
        events.push(event);
    }
    Ok(events)
}

fn truncate_torn_tail(path: &Path) -> Result<(), EventLogError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(EventLogError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    file.set_len(keep as u64)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}

fn next_seq_on_disk(path: &Path) -> Result<u64, EventLogError> {
    Ok(read_events(path)?
        .last()
        .map(|event| event.seq + 1)
        .unwrap_or(1))
}

fn file_len(path: &Path) -> Result<u64, EventLogError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(EventLogError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write `value` as pretty JSON via a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EventLogError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| EventLogError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let body =
        serde_json::to_string_pretty(value).map_err(|source| EventLogError::Serialize { source })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(|source| EventLogError::Snapshot {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| EventLogError::Snapshot {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EventLogError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(EventLogError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| EventLogError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Apply events newer than `run.last_event_seq` to the snapshot. Returns how
/// many were applied.
pub fn replay_run(run: &mut Run, events: &[Event]) -> usize {
    let since = run.last_event_seq;
    let mut applied = 0;
    for event in events.iter().filter(|event| event.seq > since) {
        let at = event.timestamp;
        match &event.kind {
            EventKind::RunStarted {
                base_sha,
                worktree_path,
                branch,
                ..
            } => {
                if run.base_sha.is_none() {
                    run.base_sha = base_sha.clone();
                }
                if run.worktree_path.is_none() {
                    run.worktree_path = worktree_path.as_ref().map(PathBuf::from);
                }
                if run.branch.is_none() {
                    run.branch = branch.clone();
                }
            }
            EventKind::PlanRecorded { milestones, .. } => {
                run.milestones = milestones.clone();
            }
            EventKind::MilestoneStarted { index, .. } => {
                run.milestone_index = run.milestone_index.max(*index);
            }
            EventKind::PhaseChanged { to, .. } => {
                run.phase = *to;
            }
            EventKind::VerifyCompleted { attempt, .. } => {
                run.verify_attempts = run.verify_attempts.max(*attempt);
            }
            EventKind::CheckpointCreated { sha, .. } | EventKind::CheckpointReused { sha, .. } => {
                run.record_checkpoint(Some(sha.clone()), at);
            }
            EventKind::MilestoneCompleted { index } => {
                run.milestone_index = run.milestone_index.max(index + 1);
            }
            EventKind::RunStopped { reason, .. } => {
                run.halt(*reason, at);
            }
            EventKind::RunResumed { to, .. } => {
                run.phase = *to;
                run.stop_reason = None;
                run.next_resume_at = None;
            }
            EventKind::AutoResumeScheduled { resume_at, .. } => {
                run.next_resume_at = Some(*resume_at);
            }
            _ => {}
        }
        if event.kind.is_progress() {
            run.last_progress_at = run.last_progress_at.max(at);
        }
        run.last_event_seq = event.seq;
        run.updated_at = run.updated_at.max(at);
        applied += 1;
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use orch_core::state::{Phase, StopReason};
    use orch_core::types::{Milestone, RunId};

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, sec).unwrap()
    }

    fn phase_changed(from: Phase, to: Phase) -> EventKind {
        EventKind::PhaseChanged {
            from,
            to,
            trigger: "test".to_string(),
        }
    }

    #[test]
    fn seq_is_monotonic_and_gapless_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");

        let mut log = EventLog::open(&path, "supervisor").expect("open");
        for sec in 0..3 {
            log.append(phase_changed(Phase::Init, Phase::Plan), at(sec), None)
                .expect("append");
        }
        drop(log);

        let mut reopened = EventLog::open(&path, "supervisor").expect("reopen");
        assert_eq!(reopened.last_seq(), 3);
        let event = reopened
            .append(EventKind::MilestoneCompleted { index: 0 }, at(9), None)
            .expect("append");
        assert_eq!(event.seq, 4);

        let seqs: Vec<u64> = read_events(&path)
            .expect("read")
            .iter()
            .map(|event| event.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn two_handles_on_one_file_keep_seq_gapless() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");

        let mut supervisor = EventLog::open(&path, "supervisor").expect("open");
        let mut submit = EventLog::open(&path, "submit").expect("open");
        supervisor
            .append(phase_changed(Phase::Init, Phase::Plan), at(0), None)
            .expect("append");
        let event = submit
            .append(EventKind::MilestoneCompleted { index: 0 }, at(1), None)
            .expect("append");
        assert_eq!(event.seq, 2);
        let event = supervisor
            .append(phase_changed(Phase::Plan, Phase::MilestoneStart), at(2), None)
            .expect("append");
        assert_eq!(event.seq, 3);
        assert_eq!(supervisor.last_seq(), 3);

        let events = read_events(&path).expect("gapless");
        let sources: Vec<&str> = events.iter().map(|event| event.source.as_str()).collect();
        assert_eq!(sources, vec!["supervisor", "submit", "supervisor"]);
    }

    #[test]
    fn torn_final_line_is_dropped_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::open(&path, "supervisor").expect("open");
        log.append(phase_changed(Phase::Init, Phase::Plan), at(0), None)
            .expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(b"{\"seq\":2,\"timest").expect("write torn");
        drop(file);

        let mut log = EventLog::open(&path, "supervisor").expect("reopen");
        assert_eq!(log.last_seq(), 1);
        let event = log
            .append(phase_changed(Phase::Plan, Phase::MilestoneStart), at(1), None)
            .expect("append");
        assert_eq!(event.seq, 2);
        assert_eq!(read_events(&path).expect("read").len(), 2);
    }

    #[test]
    fn gaps_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let event = Event {
            seq: 2,
            timestamp: at(0),
            kind: EventKind::MilestoneCompleted { index: 0 },
            source: "supervisor".to_string(),
            correlation_id: None,
        };
        fs::write(&path, format!("{}\n", serde_json::to_string(&event).unwrap())).unwrap();
        let err = read_events(&path).expect_err("gap must fail");
        assert!(matches!(
            err,
            EventLogError::Sequence {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn snapshot_round_trips_and_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.json");
        assert!(read_json::<Run>(&path).expect("read").is_none());

        let run = Run::new(RunId::new("r1"), PathBuf::from("t.md"), "T", at(0));
        write_json_atomic(&path, &run).expect("write");
        let loaded: Run = read_json(&path).expect("read").expect("present");
        assert_eq!(loaded, run);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn replay_applies_only_events_newer_than_snapshot() {
        let mut run = Run::new(RunId::new("r1"), PathBuf::from("t.md"), "T", at(0));
        let events: Vec<Event> = vec![
            phase_changed(Phase::Init, Phase::Plan),
            EventKind::PlanRecorded {
                milestones: vec![Milestone::new("a"), Milestone::new("b")],
                from_worker: false,
            },
            phase_changed(Phase::Plan, Phase::MilestoneStart),
            EventKind::CheckpointCreated {
                milestone_index: 0,
                sha: "abc".to_string(),
            },
            EventKind::MilestoneCompleted { index: 0 },
            EventKind::RunStopped {
                reason: StopReason::WorkerCallTimeout,
                phase: Phase::Stopped,
                milestone_index: 1,
            },
        ]
        .into_iter()
        .enumerate()
        .map(|(idx, kind)| Event {
            seq: idx as u64 + 1,
            timestamp: at(idx as u32 + 1),
            kind,
            source: "supervisor".to_string(),
            correlation_id: None,
        })
        .collect();

        run.last_event_seq = 1;
        run.phase = Phase::Plan;
        let applied = replay_run(&mut run, &events);
        assert_eq!(applied, 5);
        assert_eq!(run.milestones.len(), 2);
        assert_eq!(run.milestone_index, 1);
        assert_eq!(run.checkpoint_commit_sha.as_deref(), Some("abc"));
        assert_eq!(run.phase, Phase::Stopped);
        assert_eq!(run.last_active_phase, Some(Phase::MilestoneStart));
        assert_eq!(run.last_event_seq, 6);

        assert_eq!(replay_run(&mut run, &events), 0);
    }
}
