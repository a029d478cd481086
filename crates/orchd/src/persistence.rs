//! SQLite index of runs and orchestrations backing `relay status`.
//!
//! Rows are derived from snapshots; the per-run files stay authoritative.

use chrono::{DateTime, Utc};
use orch_core::state::{Phase, StopReason};
use orch_core::types::{OrchestratorId, OrchestratorState, Run, RunId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid value '{value}' in column {column}: {message}")]
    Column {
        column: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub phase: Phase,
    pub task_title: String,
    pub milestone_index: usize,
    pub milestone_count: usize,
    pub stop_reason: Option<StopReason>,
    pub checkpoint_commit_sha: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationSummary {
    pub orchestrator_id: OrchestratorId,
    pub status: String,
    pub ticks: u64,
    pub active_runs: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RunIndex {
    conn: Connection,
}

impl RunIndex {
    /// Open (creating if needed) and migrate.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let index = Self { conn };
        index.migrate()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let index = Self { conn };
        index.migrate()?;
        Ok(index)
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    phase TEXT NOT NULL,
    task_title TEXT NOT NULL,
    task_path TEXT NOT NULL,
    milestone_index INTEGER NOT NULL,
    milestone_count INTEGER NOT NULL,
    stop_reason TEXT,
    checkpoint_sha TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_phase ON runs(phase);

CREATE TABLE IF NOT EXISTS orchestrations (
    orchestrator_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    ticks INTEGER NOT NULL,
    active_runs INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_run(&self, run: &Run) -> Result<(), PersistenceError> {
        self.conn.execute(
            r#"
INSERT INTO runs (run_id, phase, task_title, task_path, milestone_index, milestone_count,
                  stop_reason, checkpoint_sha, started_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(run_id) DO UPDATE SET
  phase = excluded.phase,
  task_title = excluded.task_title,
  milestone_index = excluded.milestone_index,
  milestone_count = excluded.milestone_count,
  stop_reason = excluded.stop_reason,
  checkpoint_sha = excluded.checkpoint_sha,
  updated_at = excluded.updated_at
"#,
            params![
                run.run_id.0,
                run.phase.as_str(),
                run.task_title,
                run.task_path.display().to_string(),
                run.milestone_index as i64,
                run.milestones.len() as i64,
                run.stop_reason.map(|reason| reason.as_str()),
                run.checkpoint_commit_sha,
                run.started_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_orchestration(&self, state: &OrchestratorState) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(state)?;
        self.conn.execute(
            r#"
INSERT INTO orchestrations (orchestrator_id, status, ticks, active_runs, payload_json,
                            started_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(orchestrator_id) DO UPDATE SET
  status = excluded.status,
  ticks = excluded.ticks,
  active_runs = excluded.active_runs,
  payload_json = excluded.payload_json,
  updated_at = excluded.updated_at
"#,
            params![
                state.orchestrator_id.0,
                state.status.as_str(),
                state.ticks as i64,
                state.active_runs.len() as i64,
                payload,
                state.started_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &RunId) -> Result<Option<RunSummary>, PersistenceError> {
        let row = self
            .conn
            .query_row(
                r#"
SELECT run_id, phase, task_title, milestone_index, milestone_count, stop_reason,
       checkpoint_sha, updated_at
FROM runs WHERE run_id = ?1
"#,
                params![run_id.0],
                read_run_row,
            )
            .optional()?;
        row.map(RawRunRow::into_summary).transpose()
    }

    /// Most recently updated first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT run_id, phase, task_title, milestone_index, milestone_count, stop_reason,
       checkpoint_sha, updated_at
FROM runs ORDER BY updated_at DESC, run_id DESC
"#,
        )?;
        let rows = stmt.query_map([], read_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_summary()?);
        }
        Ok(runs)
    }

    pub fn list_orchestrations(&self) -> Result<Vec<OrchestrationSummary>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT orchestrator_id, status, ticks, active_runs, updated_at
FROM orchestrations ORDER BY updated_at DESC, orchestrator_id ASC
"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, status, ticks, active_runs, updated_at) = row?;
            out.push(OrchestrationSummary {
                orchestrator_id: OrchestratorId(id),
                status,
                ticks: ticks.max(0) as u64,
                active_runs: active_runs.max(0) as usize,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(out)
    }
}

struct RawRunRow {
    run_id: String,
    phase: String,
    task_title: String,
    milestone_index: i64,
    milestone_count: i64,
    stop_reason: Option<String>,
    checkpoint_sha: Option<String>,
    updated_at: String,
}

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRunRow> {
    Ok(RawRunRow {
        run_id: row.get(0)?,
        phase: row.get(1)?,
        task_title: row.get(2)?,
        milestone_index: row.get(3)?,
        milestone_count: row.get(4)?,
        stop_reason: row.get(5)?,
        checkpoint_sha: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawRunRow {
    fn into_summary(self) -> Result<RunSummary, PersistenceError> {
        let phase = self
            .phase
            .parse::<Phase>()
            .map_err(|message| PersistenceError::Column {
                column: "phase",
                value: self.phase.clone(),
                message,
            })?;
        let stop_reason = match self.stop_reason {
            Some(value) => Some(value.parse::<StopReason>().map_err(|message| {
                PersistenceError::Column {
                    column: "stop_reason",
                    value: value.clone(),
                    message,
                }
            })?),
            None => None,
        };
        Ok(RunSummary {
            run_id: RunId(self.run_id),
            phase,
            task_title: self.task_title,
            milestone_index: self.milestone_index.max(0) as usize,
            milestone_count: self.milestone_count.max(0) as usize,
            stop_reason,
            checkpoint_commit_sha: self.checkpoint_sha,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| PersistenceError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use orch_core::types::{CollisionPolicy, Milestone};
    use std::path::PathBuf;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, min, 0).unwrap()
    }

    #[test]
    fn upsert_run_overwrites_existing_row() {
        let index = RunIndex::open_in_memory().expect("open");
        let mut run = Run::new(RunId::new("r1"), PathBuf::from("task.md"), "Add limiter", at(0));
        index.upsert_run(&run).expect("insert");

        run.milestones = vec![Milestone::new("a"), Milestone::new("b")];
        run.milestone_index = 1;
        run.halt(StopReason::ScopeViolation, at(5));
        index.upsert_run(&run).expect("update");

        let summary = index
            .load_run(&RunId::new("r1"))
            .expect("load")
            .expect("present");
        assert_eq!(summary.phase, Phase::Stopped);
        assert_eq!(summary.stop_reason, Some(StopReason::ScopeViolation));
        assert_eq!(summary.milestone_index, 1);
        assert_eq!(summary.milestone_count, 2);
        assert_eq!(summary.updated_at, at(5));
        assert!(index.load_run(&RunId::new("missing")).expect("load").is_none());
    }

    #[test]
    fn list_runs_orders_by_recent_update() {
        let index = RunIndex::open_in_memory().expect("open");
        let older = Run::new(RunId::new("r1"), PathBuf::from("a.md"), "A", at(1));
        let newer = Run::new(RunId::new("r2"), PathBuf::from("b.md"), "B", at(2));
        index.upsert_run(&older).expect("insert");
        index.upsert_run(&newer).expect("insert");

        let ids: Vec<String> = index
            .list_runs()
            .expect("list")
            .into_iter()
            .map(|summary| summary.run_id.0)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[test]
    fn orchestrations_are_indexed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = RunIndex::open(dir.path().join("index.sqlite")).expect("open");
        let mut state = OrchestratorState::new(
            OrchestratorId("o1".to_string()),
            vec![],
            CollisionPolicy::Serialize,
            60,
            100,
            at(0),
        );
        index.upsert_orchestration(&state).expect("insert");
        state.ticks = 7;
        state.updated_at = at(3);
        index.upsert_orchestration(&state).expect("update");

        let listed = index.list_orchestrations().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ticks, 7);
        assert_eq!(listed[0].status, "running");
    }
}
