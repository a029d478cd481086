use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use orch_agents::CancelToken;
use orch_core::config::{load_orchestration_config, load_run_config_or_default, RunConfig};
use orch_core::state::Phase;
use orch_core::types::{OrchestratorId, OrchestratorStatus, Run, RunId};
use orch_core::validation::{has_errors, Validate, ValidationIssue, ValidationLevel};
use orch_git::{discover_repo, GitCli, RepoHandle};
use orchd::{
    logging, read_json, read_stop_diagnostics, BudgetGrant, Collaborators, Orchestrator, RelayPaths,
    ResumeOutcome, RunIndex, RunRequest, StepOutcome, SubmitRequest, Submitter, Supervisor,
    SupervisorLauncher, RELAY_DIR,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Exit status for a run or submit that stopped short and needs attention.
const EXIT_STOPPED: i32 = 2;
const DEFAULT_TICK_MS: u64 = 1_000;

#[derive(Parser)]
#[command(name = "relay")]
#[command(version, about = "Supervise coding-agent runs inside git worktrees")]
struct Cli {
    /// Any path inside the target repository.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Run configuration (defaults to .relay/config.toml in the repository).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a supervised run for a task file.
    Run {
        #[arg(long)]
        task: PathBuf,

        /// Files this run may modify; overrides the task's `owns`.
        #[arg(long = "owns")]
        owns: Vec<String>,
    },
    /// Continue a stopped or interrupted run.
    Resume { run_id: String },
    /// Cherry-pick a run's checkpoint onto a branch.
    Submit {
        run_id: String,

        #[arg(long = "to")]
        to: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        push: bool,
    },
    /// Run several tracks of tasks under one time budget.
    Orchestrate {
        #[arg(long, required_unless_present = "resume", conflicts_with = "resume")]
        tracks: Option<PathBuf>,

        /// Orchestration id to pick up after a crash or interrupt.
        #[arg(long)]
        resume: Option<String>,

        /// Tick interval for a resumed orchestration.
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Ticks granted to a resumed orchestration, counted from where it stopped.
        #[arg(long, requires = "resume")]
        max_ticks: Option<u64>,

        /// Active minutes granted to a resumed orchestration.
        #[arg(long, requires = "resume")]
        time_budget_minutes: Option<u64>,
    },
    /// Show one run, or list indexed runs and orchestrations.
    Status { run_id: Option<String> },
}

struct Session {
    paths: RelayPaths,
    repo: RepoHandle,
    config: RunConfig,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("relay: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let session = open_session(&cli.repo, cli.config.as_deref())?;
    match cli.command {
        Command::Run { task, owns } => run_task(&session, &task, owns),
        Command::Resume { run_id } => resume_run(&session, RunId::new(run_id)),
        Command::Submit {
            run_id,
            to,
            dry_run,
            push,
        } => submit_run(&session, RunId::new(run_id), to, dry_run, push),
        Command::Orchestrate {
            tracks,
            resume,
            tick_ms,
            max_ticks,
            time_budget_minutes,
        } => {
            let grant = BudgetGrant {
                ticks: max_ticks,
                minutes: time_budget_minutes,
            };
            orchestrate(&session, tracks, resume, tick_ms, grant)
        }
        Command::Status { run_id } => status(&session, run_id.map(RunId::new)),
    }
}

fn open_session(repo_path: &Path, config_path: Option<&Path>) -> Result<Session> {
    let repo = discover_repo(repo_path, &GitCli::default())
        .with_context(|| format!("{} is not inside a git repository", repo_path.display()))?;
    let paths = RelayPaths::new(&repo.root);
    paths.ensure_layout()?;

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo.root.join(RELAY_DIR).join("config.toml"));
    let config = load_run_config_or_default(&config_path)?;
    check_issues(&config.validate(), &config_path)?;

    Ok(Session {
        paths,
        repo,
        config,
    })
}

fn check_issues(issues: &[ValidationIssue], path: &Path) -> Result<()> {
    for issue in issues {
        if issue.level == ValidationLevel::Warning {
            warn!(path = %path.display(), code = issue.code, "{}", issue.message);
        }
    }
    if has_errors(issues) {
        let details = issues
            .iter()
            .filter(|issue| issue.level == ValidationLevel::Error)
            .map(|issue| format!("  {}: {}", issue.code, issue.message))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("invalid configuration in {}:\n{details}", path.display());
    }
    Ok(())
}

fn install_stop_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .context("failed to install signal handler")?;
    }
    Ok(flag)
}

fn run_task(session: &Session, task: &Path, owns: Vec<String>) -> Result<i32> {
    let task_path = fs::canonicalize(task)
        .with_context(|| format!("task file {} not found", task.display()))?;
    let stop = install_stop_flag()?;
    let collaborators = Collaborators::from_config(session.repo.clone(), &session.config)?;
    let request = RunRequest {
        task_path,
        owns,
        milestones: Vec::new(),
    };
    let supervisor = Supervisor::create(
        &session.paths,
        session.config.clone(),
        request,
        collaborators.workspace.as_ref(),
        Utc::now(),
    )?
    .with_index(RunIndex::open(session.paths.index_path())?)?
    .with_cancel(CancelToken::from_flag(stop));
    println!("run {} started", supervisor.run().run_id);
    drive(supervisor, &collaborators)
}

fn resume_run(session: &Session, run_id: RunId) -> Result<i32> {
    let stop = install_stop_flag()?;
    let collaborators = Collaborators::from_config(session.repo.clone(), &session.config)?;
    let mut supervisor = Supervisor::open(&session.paths, session.config.clone(), &run_id)?
        .with_index(RunIndex::open(session.paths.index_path())?)?
        .with_cancel(CancelToken::from_flag(stop));
    let now = Utc::now();
    supervisor.adopt(now)?;
    match supervisor.resume(false, now)? {
        ResumeOutcome::AlreadyDone => {
            println!("run {run_id} is already done");
            return Ok(0);
        }
        ResumeOutcome::Continued(phase) => println!("run {run_id} continuing in {phase}"),
        ResumeOutcome::Resumed { from, to } => println!("run {run_id} resumed: {from} -> {to}"),
    }
    drive(supervisor, &collaborators)
}

fn drive(mut supervisor: Supervisor, collaborators: &Collaborators) -> Result<i32> {
    let outcome = supervisor.run_to_completion(&collaborators.deps())?;
    print_run(supervisor.run());
    match outcome {
        StepOutcome::Done => Ok(0),
        StepOutcome::Interrupted => {
            println!("interrupted; continue with `relay resume {}`", supervisor.run().run_id);
            Ok(EXIT_STOPPED)
        }
        StepOutcome::Halted(_) | StepOutcome::Progressed => {
            if let Some(diagnostics) = read_stop_diagnostics(supervisor.context())? {
                println!("  remedy: {}", diagnostics.remedy);
                println!("  next:   {}", diagnostics.suggested_command);
            }
            Ok(EXIT_STOPPED)
        }
    }
}

fn submit_run(
    session: &Session,
    run_id: RunId,
    target: String,
    dry_run: bool,
    push: bool,
) -> Result<i32> {
    let git = GitCli::default().with_identity(
        session.config.checkpoint.author_name.clone(),
        session.config.checkpoint.author_email.clone(),
    );
    let submitter = Submitter::new(session.paths.clone(), session.repo.clone(), git)
        .with_env_allowlist(&session.config.scope.env_allowlist);
    let request = SubmitRequest {
        target,
        dry_run,
        push,
        remote: session.config.checkpoint.remote.clone(),
    };
    let result = submitter.submit(&run_id, &request, Utc::now())?;

    let mode = if result.dry_run { "dry run" } else { "submit" };
    if result.clean {
        println!("{mode} of {run_id} onto {}: clean", result.target);
        if let Some(sha) = &result.head_sha {
            println!("  {} is now at {sha}", result.target);
        }
        if result.pushed {
            println!("  pushed to {}", request.remote);
        }
        return Ok(0);
    }
    println!("{mode} of {run_id} onto {}: conflict (aborted, nothing changed)", result.target);
    for file in &result.conflicted_files {
        println!("  {file}");
    }
    Ok(EXIT_STOPPED)
}

fn orchestrate(
    session: &Session,
    tracks: Option<PathBuf>,
    resume: Option<String>,
    tick_ms: Option<u64>,
    grant: BudgetGrant,
) -> Result<i32> {
    let stop = install_stop_flag()?;
    let collaborators = Collaborators::from_config(session.repo.clone(), &session.config)?;
    let launcher = SupervisorLauncher::new(
        session.paths.clone(),
        session.config.clone(),
        collaborators,
    )
    .with_index(session.paths.index_path())
    .with_cancel(CancelToken::from_flag(Arc::clone(&stop)));
    let index = RunIndex::open(session.paths.index_path())?;

    let (orchestrator, interval_ms) = match (tracks, resume) {
        (_, Some(id)) => {
            let orchestrator =
                Orchestrator::resume(&session.paths, &OrchestratorId(id), launcher, grant, Utc::now())?;
            (orchestrator, tick_ms.unwrap_or(DEFAULT_TICK_MS))
        }
        (Some(tracks), None) => {
            let tracks = fs::canonicalize(&tracks)
                .with_context(|| format!("tracks file {} not found", tracks.display()))?;
            let config = load_orchestration_config(&tracks)?;
            check_issues(&config.validate(), &tracks)?;
            let base_dir = tracks.parent().unwrap_or(Path::new("."));
            let orchestrator =
                Orchestrator::start(&session.paths, &config, base_dir, launcher, Utc::now())?;
            (orchestrator, tick_ms.unwrap_or(config.tick_interval_ms))
        }
        (None, None) => bail!("either --tracks or --resume is required"),
    };
    let mut orchestrator = orchestrator.with_index(index)?;
    let id = orchestrator.state().orchestrator_id.clone();
    println!("orchestration {id} running");

    let status = orchestrator.run(&stop, Duration::from_millis(interval_ms))?;
    let state = orchestrator.state();
    println!(
        "orchestration {id}: {status} after {} ticks ({}s active)",
        state.ticks,
        state.active_elapsed_ms / 1_000
    );
    for track in &state.tracks {
        let done = track.steps.iter().filter(|step| step.result.is_some()).count();
        println!("  {:<16} {done}/{} steps", track.id.0, track.steps.len());
        for (index, step) in track.steps.iter().enumerate() {
            if let Some(result) = &step.result {
                let reason = result.stop_reason.map(|reason| reason.as_str()).unwrap_or("");
                println!("    {}. {} {reason}", index + 1, result.status);
            }
        }
    }
    match status {
        OrchestratorStatus::Completed => Ok(0),
        OrchestratorStatus::Interrupted => {
            println!("continue with `relay orchestrate --resume {id}`");
            Ok(EXIT_STOPPED)
        }
        _ => Ok(EXIT_STOPPED),
    }
}

fn status(session: &Session, run_id: Option<RunId>) -> Result<i32> {
    if let Some(run_id) = run_id {
        let ctx = session.paths.run_context(run_id.clone());
        let Some(run) = read_json::<Run>(&ctx.state_path())? else {
            bail!("run {run_id} not found under {}", session.paths.run_dir(&run_id).display());
        };
        print_run(&run);
        if let Some(branch) = &run.branch {
            println!("  branch: {branch}");
        }
        if let Some(path) = &run.worktree_path {
            println!("  worktree: {}", path.display());
        }
        if let Some(sha) = &run.checkpoint_commit_sha {
            println!("  checkpoint: {sha}");
        }
        if run.phase.is_halted() {
            if let Some(diagnostics) = read_stop_diagnostics(&ctx)? {
                println!("  remedy: {}", diagnostics.remedy);
                println!("  next:   {}", diagnostics.suggested_command);
            }
        }
        return Ok(0);
    }

    let index = RunIndex::open(session.paths.index_path())?;
    let runs = index.list_runs()?;
    if runs.is_empty() {
        println!("no runs");
    }
    for summary in runs {
        let reason = summary.stop_reason.map(|reason| reason.as_str()).unwrap_or("");
        println!(
            "{:<28} {:<14} {}/{} {:<28} {}",
            summary.run_id.0,
            summary.phase.as_str(),
            (summary.milestone_index + 1).min(summary.milestone_count),
            summary.milestone_count,
            reason,
            summary.task_title
        );
    }
    for summary in index.list_orchestrations()? {
        println!(
            "{:<28} {:<20} ticks={} active={}",
            summary.orchestrator_id.0, summary.status, summary.ticks, summary.active_runs
        );
    }
    Ok(0)
}

fn print_run(run: &Run) {
    let milestones = run.milestones.len();
    let position = if milestones == 0 {
        "planning".to_string()
    } else if run.phase == Phase::Done {
        format!("{milestones}/{milestones} milestones")
    } else {
        format!("milestone {}/{milestones}", run.milestone_index + 1)
    };
    match run.stop_reason {
        Some(reason) if run.phase.is_halted() => {
            println!("run {} [{}] {}: {position}, stopped: {reason}", run.run_id, run.phase, run.task_title)
        }
        _ => println!("run {} [{}] {}: {position}", run.run_id, run.phase, run.task_title),
    }
}
