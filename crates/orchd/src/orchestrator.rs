//! Tick-based scheduler over a fixed set of tracks.
//!
//! State is persisted after every tick and whenever a run becomes active, so
//! a restarted orchestrator picks up exactly where the last one stopped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orch_core::config::OrchestrationConfig;
use orch_core::events::EventKind;
use orch_core::state::StopReason;
use orch_core::types::{
    OrchestratorId, OrchestratorState, OrchestratorStatus, RunId, StepResult, StepStatus, TrackId,
};
use tracing::{debug, info, warn};

use crate::collision::{check_collision, CollisionDecision};
use crate::context::{LayoutError, RelayPaths};
use crate::event_log::{read_json, write_json_atomic, EventLog, EventLogError};
use crate::launcher::{RunLauncher, RunProgress};
use crate::persistence::{PersistenceError, RunIndex};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("orchestration {id} not found (no state.json under {path})")]
    NotFound { id: OrchestratorId, path: PathBuf },
    #[error("orchestration {id} already exists; use `relay orchestrate --resume {id}`")]
    AlreadyExists { id: OrchestratorId },
}

/// Budget handed to a resumed orchestration, counted from where it stopped.
/// An unset field renews only an exhausted budget, by its original amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetGrant {
    pub ticks: Option<u64>,
    pub minutes: Option<u64>,
}

pub struct Orchestrator<L: RunLauncher> {
    dir: PathBuf,
    state: OrchestratorState,
    log: EventLog,
    index: Option<RunIndex>,
    launcher: L,
    /// In-process only: time between a crash and the restart is not charged.
    last_tick_at: Option<DateTime<Utc>>,
    /// Last blocker reported per deferred track.
    deferred: BTreeMap<TrackId, TrackId>,
}

impl<L: RunLauncher> Orchestrator<L> {
    /// Begin a new orchestration over `config.tracks`. Relative task paths
    /// resolve against `base_dir`.
    pub fn start(
        paths: &RelayPaths,
        config: &OrchestrationConfig,
        base_dir: &Path,
        launcher: L,
        now: DateTime<Utc>,
    ) -> Result<Self, OrchestratorError> {
        paths.ensure_layout()?;
        let id = config
            .orchestrator_id
            .clone()
            .map(OrchestratorId)
            .unwrap_or_else(|| OrchestratorId::generate(now));
        let dir = paths.orchestration_dir(&id);
        if dir.join("state.json").exists() {
            return Err(OrchestratorError::AlreadyExists { id });
        }

        let state = OrchestratorState::new(
            id,
            config.build_tracks(base_dir),
            config.collision_policy,
            config.time_budget_minutes,
            config.max_ticks,
            now,
        );
        let orchestrator = Self::assemble(dir, state, launcher)?;
        orchestrator.persist()?;
        info!(
            orchestrator = %orchestrator.state.orchestrator_id,
            tracks = orchestrator.state.tracks.len(),
            policy = %orchestrator.state.collision_policy,
            "orchestration started"
        );
        Ok(orchestrator)
    }

    /// Reload a persisted orchestration and reconcile its active runs. An
    /// interrupted or budget-stopped orchestration runs again.
    pub fn resume(
        paths: &RelayPaths,
        id: &OrchestratorId,
        launcher: L,
        grant: BudgetGrant,
        now: DateTime<Utc>,
    ) -> Result<Self, OrchestratorError> {
        let dir = paths.orchestration_dir(id);
        let state_path = dir.join("state.json");
        let state: OrchestratorState =
            read_json(&state_path)?.ok_or_else(|| OrchestratorError::NotFound {
                id: id.clone(),
                path: state_path.clone(),
            })?;
        let mut orchestrator = Self::assemble(dir, state, launcher)?;
        if orchestrator.state.status != OrchestratorStatus::Completed {
            orchestrator.state.status = OrchestratorStatus::Running;
            orchestrator.state.stop_reason = None;
            orchestrator.renew_budget(grant);
        }

        let active: Vec<(TrackId, RunId)> = orchestrator
            .state
            .active_runs
            .iter()
            .map(|(track, run)| (track.clone(), run.clone()))
            .collect();
        for (track, run_id) in &active {
            match orchestrator.launcher.reconcile(run_id, now) {
                Ok(RunProgress::Finished(result)) => {
                    orchestrator.complete_step(track, run_id, result, now)?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(track = %track, run_id = %run_id, error = %err, "could not reconcile run");
                    let result = failed_result(err.to_string());
                    orchestrator.complete_step(track, run_id, result, now)?;
                }
            }
        }

        orchestrator.record(
            EventKind::OrchestrationResumed {
                ticks: orchestrator.state.ticks,
                active_runs: orchestrator.state.active_runs.len(),
            },
            now,
        )?;
        orchestrator.state.updated_at = now;
        orchestrator.persist()?;
        info!(
            orchestrator = %id,
            ticks = orchestrator.state.ticks,
            active = orchestrator.state.active_runs.len(),
            "orchestration resumed"
        );
        Ok(orchestrator)
    }

    fn renew_budget(&mut self, grant: BudgetGrant) {
        let state = &mut self.state;
        if grant.ticks.is_some() || state.ticks >= state.max_ticks {
            let allowance = if state.tick_allowance > 0 {
                state.tick_allowance
            } else {
                state.max_ticks
            };
            state.max_ticks = state.ticks.saturating_add(grant.ticks.unwrap_or(allowance));
        }
        if grant.minutes.is_some() || state.active_elapsed_ms >= state.time_budget_ms() {
            let allowance = if state.time_allowance_minutes > 0 {
                state.time_allowance_minutes
            } else {
                state.time_budget_minutes
            };
            let spent_minutes = state.active_elapsed_ms.div_ceil(60_000);
            state.time_budget_minutes = spent_minutes.saturating_add(grant.minutes.unwrap_or(allowance));
        }
        debug!(
            orchestrator = %state.orchestrator_id,
            max_ticks = state.max_ticks,
            time_budget_minutes = state.time_budget_minutes,
            "budget renewed"
        );
    }

    fn assemble(dir: PathBuf, state: OrchestratorState, launcher: L) -> Result<Self, OrchestratorError> {
        let log = EventLog::open(dir.join("events.jsonl"), "orchestrator")?;
        Ok(Self {
            dir,
            state,
            log,
            index: None,
            launcher,
            last_tick_at: None,
            deferred: BTreeMap::new(),
        })
    }

    pub fn with_index(mut self, index: RunIndex) -> Result<Self, OrchestratorError> {
        index.upsert_orchestration(&self.state)?;
        self.index = Some(index);
        Ok(self)
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    /// Tick until finished or `stop` is raised; `stop` is checked between ticks.
    pub fn run(
        &mut self,
        stop: &AtomicBool,
        tick_interval: Duration,
    ) -> Result<OrchestratorStatus, OrchestratorError> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return self.interrupt(Utc::now());
            }
            let status = self.tick(Utc::now())?;
            if status.is_finished() {
                return Ok(status);
            }
            thread::sleep(tick_interval);
        }
    }

    /// Stop at a tick boundary; resumable.
    pub fn interrupt(&mut self, now: DateTime<Utc>) -> Result<OrchestratorStatus, OrchestratorError> {
        self.finish(OrchestratorStatus::Interrupted, None, now)?;
        Ok(OrchestratorStatus::Interrupted)
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<OrchestratorStatus, OrchestratorError> {
        if self.state.status.is_finished() {
            return Ok(self.state.status);
        }
        if let Some(last) = self.last_tick_at {
            let spent = now.signed_duration_since(last).num_milliseconds().max(0) as u64;
            self.state.active_elapsed_ms = self.state.active_elapsed_ms.saturating_add(spent);
        }
        self.last_tick_at = Some(now);

        if let Some((status, reason)) = self.budget_verdict() {
            self.finish(status, reason, now)?;
            return Ok(status);
        }

        let tick = self.state.ticks;
        debug!(orchestrator = %self.state.orchestrator_id, tick, "tick");
        self.start_idle_tracks(now)?;
        self.advance_active_runs(now)?;

        self.state.ticks += 1;
        self.state.updated_at = now;
        self.persist()?;
        Ok(self.state.status)
    }

    fn budget_verdict(&self) -> Option<(OrchestratorStatus, Option<StopReason>)> {
        if self.state.all_tracks_complete() {
            return Some((OrchestratorStatus::Completed, None));
        }
        if self.state.ticks >= self.state.max_ticks {
            return Some((
                OrchestratorStatus::MaxTicksReached,
                Some(StopReason::MaxTicksReached),
            ));
        }
        if self.state.active_elapsed_ms >= self.state.time_budget_ms() {
            return Some((
                OrchestratorStatus::TimeBudgetExceeded,
                Some(StopReason::TimeBudgetExceeded),
            ));
        }
        None
    }

    fn finish(
        &mut self,
        status: OrchestratorStatus,
        reason: Option<StopReason>,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        self.state.status = status;
        self.state.stop_reason = reason;
        self.state.updated_at = now;
        self.record(
            EventKind::OrchestrationStopped {
                status,
                ticks: self.state.ticks,
            },
            now,
        )?;
        self.persist()?;
        info!(
            orchestrator = %self.state.orchestrator_id,
            %status,
            ticks = self.state.ticks,
            active_elapsed_ms = self.state.active_elapsed_ms,
            "orchestration stopped"
        );
        Ok(())
    }

    /// `owns` of the step each active run is executing.
    fn active_scopes(&self) -> Vec<(TrackId, Vec<String>)> {
        self.state
            .active_runs
            .iter()
            .filter_map(|(track_id, run_id)| {
                let track = self.state.track(track_id)?;
                let step = track
                    .steps
                    .iter()
                    .find(|step| step.run_id.as_ref() == Some(run_id))?;
                Some((track_id.clone(), step.owns.clone()))
            })
            .collect()
    }

    fn start_idle_tracks(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let track_ids: Vec<TrackId> = self.state.tracks.iter().map(|track| track.id.clone()).collect();
        for track_id in track_ids {
            if self.state.active_runs.contains_key(&track_id) {
                continue;
            }
            let Some(track) = self.state.track(&track_id) else {
                continue;
            };
            let Some(step_index) = track.cursor() else {
                continue;
            };
            let step = track.steps[step_index].clone();

            match check_collision(self.state.collision_policy, &step.owns, &self.active_scopes()) {
                CollisionDecision::Defer { blocked_by } => {
                    if self.deferred.get(&track_id) != Some(&blocked_by) {
                        debug!(track = %track_id, step = step_index, blocked_by = %blocked_by, "step deferred");
                        self.record(
                            EventKind::TrackStepDeferred {
                                track: track_id.clone(),
                                step: step_index,
                                blocked_by: blocked_by.clone(),
                            },
                            now,
                        )?;
                        self.deferred.insert(track_id.clone(), blocked_by);
                    }
                }
                CollisionDecision::Start => {
                    self.deferred.remove(&track_id);
                    match self.launcher.start(&step.task, &step.owns, now) {
                        Ok(run_id) => {
                            if let Some(track) = self.state.track_mut(&track_id) {
                                track.steps[step_index].run_id = Some(run_id.clone());
                            }
                            self.state.active_runs.insert(track_id.clone(), run_id.clone());
                            self.record(
                                EventKind::TrackStepStarted {
                                    track: track_id.clone(),
                                    step: step_index,
                                    run_id: run_id.clone(),
                                },
                                now,
                            )?;
                            self.state.updated_at = now;
                            self.persist()?;
                            info!(track = %track_id, step = step_index, run_id = %run_id, "step started");
                        }
                        Err(err) => {
                            warn!(track = %track_id, step = step_index, error = %err, "step failed to launch");
                            self.record_step_result(
                                &track_id,
                                step_index,
                                None,
                                failed_result(err.to_string()),
                                now,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn advance_active_runs(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let active: Vec<(TrackId, RunId)> = self
            .state
            .active_runs
            .iter()
            .map(|(track, run)| (track.clone(), run.clone()))
            .collect();
        for (track_id, run_id) in active {
            match self.launcher.advance(&run_id, now) {
                Ok(RunProgress::Running) => {}
                Ok(RunProgress::Waiting { resume_at }) => {
                    debug!(track = %track_id, run_id = %run_id, %resume_at, "run waiting for auto-resume");
                }
                Ok(RunProgress::Finished(result)) => {
                    self.complete_step(&track_id, &run_id, result, now)?;
                }
                Err(err) => {
                    warn!(track = %track_id, run_id = %run_id, error = %err, "run failed");
                    self.complete_step(&track_id, &run_id, failed_result(err.to_string()), now)?;
                }
            }
        }
        Ok(())
    }

    fn complete_step(
        &mut self,
        track_id: &TrackId,
        run_id: &RunId,
        result: StepResult,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        self.state.active_runs.remove(track_id);
        let step_index = self.state.track(track_id).and_then(|track| {
            track
                .steps
                .iter()
                .position(|step| step.run_id.as_ref() == Some(run_id))
        });
        let Some(step_index) = step_index else {
            warn!(track = %track_id, run_id = %run_id, "finished run has no step");
            return Ok(());
        };
        self.record_step_result(track_id, step_index, Some(run_id.clone()), result, now)
    }

    fn record_step_result(
        &mut self,
        track_id: &TrackId,
        step_index: usize,
        run_id: Option<RunId>,
        result: StepResult,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        if let Some(track) = self.state.track_mut(track_id) {
            track.steps[step_index].result = Some(result.clone());
        }
        info!(
            track = %track_id,
            step = step_index,
            status = %result.status,
            stop_reason = result.stop_reason.map(StopReason::as_str).unwrap_or(""),
            "step finished"
        );
        self.record(
            EventKind::TrackStepCompleted {
                track: track_id.clone(),
                step: step_index,
                run_id,
                result,
            },
            now,
        )?;
        Ok(())
    }

    fn record(&mut self, kind: EventKind, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        self.log
            .append(kind, now, Some(self.state.orchestrator_id.0.clone()))?;
        Ok(())
    }

    fn persist(&self) -> Result<(), OrchestratorError> {
        write_json_atomic(&self.dir.join("state.json"), &self.state)?;
        if let Some(index) = &self.index {
            index.upsert_orchestration(&self.state)?;
        }
        Ok(())
    }
}

fn failed_result(detail: String) -> StepResult {
    StepResult {
        status: StepStatus::Failed,
        stop_reason: None,
        elapsed_ms: 0,
        detail: Some(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::read_events;
    use crate::test_support::FakeLauncher;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use orch_core::config::parse_orchestration_config;
    use orch_core::types::CollisionPolicy;

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 6, 0, 0).unwrap() + ChronoDuration::seconds(sec)
    }

    fn config(policy: &str) -> OrchestrationConfig {
        parse_orchestration_config(&format!(
            r#"
orchestrator_id = "orch-test"
collision_policy = "{policy}"
time_budget_minutes = 60
max_ticks = 100

[[tracks]]
name = "api"
[[tracks.steps]]
task = "tasks/api-1.md"
owns = ["src/api/**"]
[[tracks.steps]]
task = "tasks/api-2.md"
owns = ["src/api/**"]

[[tracks]]
name = "routes"
[[tracks.steps]]
task = "tasks/routes.md"
owns = ["src/api/routes.rs"]
"#
        ))
        .expect("parse tracks")
    }

    fn event_names(orchestrator: &Orchestrator<FakeLauncher>) -> Vec<&'static str> {
        read_events(&orchestrator.events_path())
            .expect("events")
            .iter()
            .map(|event| event.kind.name())
            .collect()
    }

    #[test]
    fn serialize_never_runs_overlapping_scopes_together() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let config = config("serialize");
        let mut orchestrator =
            Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(2), at(0))
                .expect("start");
        assert_eq!(orchestrator.state().collision_policy, CollisionPolicy::Serialize);

        let mut status = OrchestratorStatus::Running;
        for tick in 0..20 {
            status = orchestrator.tick(at(tick)).expect("tick");
            assert!(orchestrator.state().active_runs.len() <= 1);
            if status.is_finished() {
                break;
            }
        }
        assert_eq!(status, OrchestratorStatus::Completed);

        let started: Vec<String> = orchestrator
            .launcher()
            .started()
            .iter()
            .map(|task| task.file_name().unwrap_or_default().to_string_lossy().into_owned())
            .collect();
        assert_eq!(started, vec!["api-1.md", "api-2.md", "routes.md"]);

        let names = event_names(&orchestrator);
        let deferred = names.iter().filter(|name| **name == "track_step_deferred").count();
        assert_eq!(deferred, 1);
        assert_eq!(names.last(), Some(&"orchestration_stopped"));
    }

    #[test]
    fn parallel_starts_every_idle_track_at_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut orchestrator = Orchestrator::start(
            &paths,
            &config("parallel"),
            dir.path(),
            FakeLauncher::finishing_after(5),
            at(0),
        )
        .expect("start");

        orchestrator.tick(at(0)).expect("tick");
        assert_eq!(orchestrator.state().active_runs.len(), 2);
    }

    #[test]
    fn crash_resume_continues_without_repeating_finished_steps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let id = OrchestratorId("orch-test".to_string());
        {
            let mut orchestrator = Orchestrator::start(
                &paths,
                &config("serialize"),
                dir.path(),
                FakeLauncher::finishing_after(2),
                at(0),
            )
            .expect("start");
            for tick in 0..3 {
                orchestrator.tick(at(tick)).expect("tick");
            }
            let api = orchestrator.state().track(&TrackId::new("api")).expect("api");
            assert!(api.steps[0].result.is_some());
            assert!(api.steps[1].run_id.is_some());
            assert!(api.steps[1].result.is_none());
        }

        let mut resumed = Orchestrator::resume(&paths, &id, FakeLauncher::finishing_after(1), BudgetGrant::default(), at(100))
            .expect("resume");
        assert_eq!(resumed.state().status, OrchestratorStatus::Running);
        assert_eq!(resumed.state().ticks, 3);
        assert_eq!(resumed.launcher().reconciled().len(), 1);

        let mut status = OrchestratorStatus::Running;
        for tick in 0..20 {
            status = resumed.tick(at(101 + tick)).expect("tick");
            if status.is_finished() {
                break;
            }
        }
        assert_eq!(status, OrchestratorStatus::Completed);
        let restarted: Vec<&PathBuf> = resumed
            .launcher()
            .started()
            .iter()
            .filter(|task| task.ends_with("tasks/api-1.md"))
            .collect();
        assert!(restarted.is_empty());
        assert!(resumed
            .state()
            .tracks
            .iter()
            .all(|track| track.steps.iter().all(|step| step.result.is_some())));
        assert!(event_names(&resumed).contains(&"orchestration_resumed"));
    }

    #[test]
    fn max_ticks_stops_the_orchestration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut config = config("parallel");
        config.max_ticks = 2;
        let mut orchestrator =
            Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(50), at(0))
                .expect("start");

        assert_eq!(orchestrator.tick(at(0)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(orchestrator.tick(at(1)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(
            orchestrator.tick(at(2)).expect("tick"),
            OrchestratorStatus::MaxTicksReached
        );
        assert_eq!(orchestrator.state().stop_reason, Some(StopReason::MaxTicksReached));
        assert_eq!(orchestrator.state().ticks, 2);
    }

    #[test]
    fn time_budget_counts_only_time_spent_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut config = config("parallel");
        config.time_budget_minutes = 1;
        let id = OrchestratorId("orch-test".to_string());
        {
            let mut orchestrator =
                Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(1_000), at(0))
                    .expect("start");
            orchestrator.tick(at(0)).expect("tick");
            orchestrator.tick(at(50)).expect("tick");
            assert_eq!(orchestrator.state().active_elapsed_ms, 50_000);
        }

        let mut resumed = Orchestrator::resume(&paths, &id, FakeLauncher::finishing_after(1_000), BudgetGrant::default(), at(600))
            .expect("resume");
        assert_eq!(resumed.tick(at(600)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(resumed.state().active_elapsed_ms, 50_000);
        assert_eq!(
            resumed.tick(at(611)).expect("tick"),
            OrchestratorStatus::TimeBudgetExceeded
        );
    }

    #[test]
    fn launch_failure_records_failed_step_and_moves_on() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let launcher = FakeLauncher::finishing_after(1).failing_on("routes.md");
        let mut orchestrator =
            Orchestrator::start(&paths, &config("parallel"), dir.path(), launcher, at(0))
                .expect("start");

        orchestrator.tick(at(0)).expect("tick");
        let routes = orchestrator
            .state()
            .track(&TrackId::new("routes"))
            .expect("routes");
        let result = routes.steps[0].result.as_ref().expect("result");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(!orchestrator.state().active_runs.contains_key(&TrackId::new("routes")));
    }

    #[test]
    fn stop_flag_interrupts_and_resume_restores_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut orchestrator = Orchestrator::start(
            &paths,
            &config("serialize"),
            dir.path(),
            FakeLauncher::finishing_after(3),
            at(0),
        )
        .expect("start");

        let stop = AtomicBool::new(true);
        let status = orchestrator
            .run(&stop, Duration::from_millis(1))
            .expect("run");
        assert_eq!(status, OrchestratorStatus::Interrupted);

        let resumed = Orchestrator::resume(
            &paths,
            &OrchestratorId("orch-test".to_string()),
            FakeLauncher::finishing_after(3),
            BudgetGrant::default(),
            at(5),
        )
        .expect("resume");
        assert_eq!(resumed.state().status, OrchestratorStatus::Running);
    }

    #[test]
    fn resume_after_max_ticks_renews_the_tick_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut config = config("parallel");
        config.max_ticks = 2;
        let id = OrchestratorId("orch-test".to_string());
        {
            let mut orchestrator =
                Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(50), at(0))
                    .expect("start");
            for sec in 0..3 {
                orchestrator.tick(at(sec)).expect("tick");
            }
            assert_eq!(orchestrator.state().status, OrchestratorStatus::MaxTicksReached);
        }

        let mut resumed = Orchestrator::resume(
            &paths,
            &id,
            FakeLauncher::finishing_after(50),
            BudgetGrant::default(),
            at(10),
        )
        .expect("resume");
        assert_eq!(resumed.state().status, OrchestratorStatus::Running);
        assert_eq!(resumed.state().stop_reason, None);
        assert_eq!(resumed.state().max_ticks, 4);
        assert_eq!(resumed.tick(at(10)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(resumed.tick(at(11)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(
            resumed.tick(at(12)).expect("tick"),
            OrchestratorStatus::MaxTicksReached
        );
        assert_eq!(resumed.state().ticks, 4);
        drop(resumed);

        let granted = Orchestrator::resume(
            &paths,
            &id,
            FakeLauncher::finishing_after(50),
            BudgetGrant {
                ticks: Some(10),
                minutes: None,
            },
            at(20),
        )
        .expect("resume");
        assert_eq!(granted.state().max_ticks, 14);
        assert_eq!(granted.state().time_budget_minutes, 60);
    }

    #[test]
    fn resume_after_time_budget_grants_more_minutes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let mut config = config("parallel");
        config.time_budget_minutes = 1;
        let id = OrchestratorId("orch-test".to_string());
        {
            let mut orchestrator =
                Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(1_000), at(0))
                    .expect("start");
            orchestrator.tick(at(0)).expect("tick");
            assert_eq!(
                orchestrator.tick(at(61)).expect("tick"),
                OrchestratorStatus::TimeBudgetExceeded
            );
        }

        let mut resumed = Orchestrator::resume(
            &paths,
            &id,
            FakeLauncher::finishing_after(1_000),
            BudgetGrant {
                ticks: None,
                minutes: Some(5),
            },
            at(100),
        )
        .expect("resume");
        assert_eq!(resumed.state().status, OrchestratorStatus::Running);
        assert_eq!(resumed.state().time_budget_minutes, 7);
        assert_eq!(resumed.state().max_ticks, 100);
        assert_eq!(resumed.tick(at(100)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(resumed.tick(at(300)).expect("tick"), OrchestratorStatus::Running);
        assert_eq!(resumed.state().active_elapsed_ms, 261_000);
    }

    #[test]
    fn starting_an_existing_orchestration_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let config = config("serialize");
        Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(1), at(0))
            .expect("first");
        let err = Orchestrator::start(&paths, &config, dir.path(), FakeLauncher::finishing_after(1), at(1))
            .err()
            .expect("duplicate");
        assert!(matches!(err, OrchestratorError::AlreadyExists { .. }));
    }
}
