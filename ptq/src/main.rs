//! `ptq`: dispatch coding agents to investigate PyTorch issues on local or
//! reserved GPU machines.
//!
//! Each job runs in its own git worktree of a shared PyTorch checkout. State
//! lives under `~/.ptq` (or `$PTQ_HOME`); see `ptq --help` for commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};

use ptq::auto::{AutoRequest, release_job, run_auto};
use ptq::controller::{
    Controller, JobStatus, KillOutcome, LaunchOptions, LaunchReport, RunRequest, resolve_task,
};
use ptq::core::events::render_event;
use ptq::core::lifecycle::liveness_label;
use ptq::core::types::{Machine, Target, TaskSpec};
use ptq::exit_codes;
use ptq::interrupt;
use ptq::io::agent::StreamEnd;
use ptq::io::issue::GhIssueSource;
use ptq::io::reservation::{GpuDevReservations, ReservationRequest};
use ptq::io::results::Artifacts;
use ptq::io::workspace::{EnsureOutcome, WheelVariant};
use ptq::logging;

#[derive(Parser)]
#[command(
    name = "ptq",
    version,
    about = "PyTorch job queue: run coding agents against PyTorch issues"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reserve a GPU machine, set it up, run the agent, fetch results, release.
    Auto {
        #[command(flatten)]
        task: TaskArgs,
        /// GPU type to reserve (default from config).
        #[arg(long)]
        gpu_type: Option<String>,
        /// Number of GPUs to reserve.
        #[arg(long)]
        gpus: Option<u32>,
        /// Reservation length in hours.
        #[arg(long)]
        hours: Option<f64>,
        /// Don't ask the agent to open a draft PR.
        #[arg(long)]
        no_pr: bool,
        #[command(flatten)]
        agent: AgentArgs,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// Provision the workspace on a machine (idempotent).
    Setup {
        /// SSH host to set up.
        machine: Option<String>,
        /// Set up this machine instead of a remote one.
        #[arg(long, conflicts_with = "machine")]
        local: bool,
        /// CUDA wheel tag (e.g. cu128); detected from nvidia-smi if omitted.
        #[arg(long)]
        cuda: Option<String>,
        /// Install the CPU-only wheel.
        #[arg(long, conflicts_with = "cuda")]
        cpu: bool,
        /// Workspace root on the machine (default from config).
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Launch (or re-run) a job.
    Run {
        /// Re-run this job (id or issue number) instead of naming a task.
        job_id: Option<String>,
        #[command(flatten)]
        task: TaskArgs,
        /// SSH host to run on.
        #[arg(long, conflicts_with = "local")]
        machine: Option<String>,
        /// Run on this machine.
        #[arg(long)]
        local: bool,
        /// Workspace root on the machine (default from config).
        #[arg(long)]
        workspace: Option<String>,
        #[command(flatten)]
        agent: AgentArgs,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// Fetch a job's report, diff, worklog and logs.
    Results { job: String },
    /// Apply a job's diff to a local PyTorch checkout on branch `ptq/<issue>`.
    Apply {
        job: String,
        #[arg(long)]
        pytorch_path: PathBuf,
    },
    /// List all jobs.
    List,
    /// Show status, worklog and recent log events.
    Peek {
        job: String,
        /// Number of log lines to summarize.
        #[arg(long, default_value_t = 20)]
        log: usize,
    },
    /// Show one job's state and last log line.
    Status { job: String },
    /// Kill a job's agent and all its child processes.
    Kill { job: String },
    /// Kill every agent on a machine, tracked or not.
    Prune {
        machine: Option<String>,
        #[arg(long, conflicts_with = "machine")]
        local: bool,
        /// Workspace root on the machine (default from config).
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Remove old jobs (worktree, job directory and record).
    Clean {
        machine: Option<String>,
        #[arg(long, conflicts_with = "machine")]
        local: bool,
        /// Keep this many of the most recent jobs.
        #[arg(long, default_value_t = 0)]
        keep: usize,
        /// Also kill and remove running jobs.
        #[arg(long)]
        all: bool,
        /// Workspace root on the machine (default from config).
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Release the reservation held by a job started with `auto --no-follow`.
    Release { job: String },
}

#[derive(Args, Debug, Default)]
#[group(multiple = false)]
struct TaskArgs {
    /// GitHub issue number.
    #[arg(long)]
    issue: Option<u64>,
    /// Freeform task text.
    #[arg(short = 'm', long = "message")]
    message: Option<String>,
    /// File containing the task text.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,
}

impl TaskArgs {
    fn spec(self) -> Option<TaskSpec> {
        if let Some(number) = self.issue {
            return Some(TaskSpec::Issue(number));
        }
        if let Some(text) = self.message {
            return Some(TaskSpec::Freeform(text));
        }
        self.input.map(TaskSpec::FromFile)
    }
}

#[derive(Args, Debug, Default)]
struct AgentArgs {
    /// Agent model (default from config).
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_turns: Option<u32>,
    /// Extra steering text for this run.
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,
}

#[derive(Args, Debug, Default)]
struct FollowArgs {
    /// Stream agent output until it exits (default).
    #[arg(long, overrides_with = "no_follow")]
    follow: bool,
    /// Return right after launching.
    #[arg(long)]
    no_follow: bool,
}

impl FollowArgs {
    fn enabled(&self) -> bool {
        !self.no_follow
    }
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("error: {:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    interrupt::install()?;
    let controller = Controller::open()?;
    match cli.command {
        Command::Auto {
            task,
            gpu_type,
            gpus,
            hours,
            no_pr,
            agent,
            follow,
        } => cmd_auto(&controller, task, gpu_type, gpus, hours, no_pr, agent, follow),
        Command::Setup {
            machine,
            local,
            cuda,
            cpu,
            workspace,
        } => {
            let wheel = match (cuda, cpu) {
                (_, true) => WheelVariant::Cpu,
                (Some(tag), false) => WheelVariant::Cuda(tag),
                (None, false) => WheelVariant::Detect,
            };
            let target = target_arg(&controller, machine, local, workspace)?;
            println!("Setting up {} at {}...", target.machine, target.workspace);
            match controller.setup(&target, wheel)? {
                EnsureOutcome::AlreadyReady => println!("Workspace already set up."),
                EnsureOutcome::Provisioned {
                    revision,
                    wheel_tag,
                } => println!("Workspace ready: torch nightly ({wheel_tag}), pytorch at {revision}."),
            }
            Ok(())
        }
        Command::Run {
            job_id,
            task,
            machine,
            local,
            workspace,
            agent,
            follow,
        } => {
            let request = run_request(&controller, job_id, task.spec(), machine, local, workspace)?;
            let opts = launch_options(agent, &follow, false);
            let issues = GhIssueSource {
                repo: controller.config().repo.clone(),
            };
            let report = controller.run(&issues, request, &opts, &mut print_event)?;
            print_launch(&report);
            Ok(())
        }
        Command::Results { job } => {
            let (job, artifacts) = controller.fetch_results(&job)?;
            println!("Results for {}:", job.job_id);
            print_artifacts(&artifacts);
            Ok(())
        }
        Command::Apply { job, pytorch_path } => {
            let (outcome, commands) = controller.apply(&job, &pytorch_path)?;
            let verb = if outcome.created_branch { "Created" } else { "Switched to" };
            println!("{verb} branch {} and applied the diff.", outcome.branch);
            println!();
            println!("{commands}");
            Ok(())
        }
        Command::List => {
            let jobs = controller.list()?;
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            println!(
                "{:<32} {:<40} {:<16} {:<10} {:<9} RUNS",
                "JOB", "TASK", "MACHINE", "STATE", "LIVE"
            );
            for status in &jobs {
                let job = &status.job;
                println!(
                    "{:<32} {:<40} {:<16} {:<10} {:<9} {}",
                    job.job_id,
                    job.task.label(40),
                    job.machine.to_string(),
                    job.state.to_string(),
                    live_label(status),
                    job.run_count
                );
            }
            Ok(())
        }
        Command::Peek { job, log } => {
            let report = controller.peek(&job, log)?;
            print_status_line(&report.status);
            match &report.worklog {
                Some(worklog) => {
                    println!("\n--- worklog ---");
                    println!("{}", worklog.trim_end());
                }
                None => println!("\n(no worklog yet)"),
            }
            if !report.log_summaries.is_empty() {
                println!("\n--- recent activity ---");
                for line in &report.log_summaries {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Command::Status { job } => {
            let report = controller.status(&job)?;
            print_status_line(&report.status);
            if let Some(line) = report.last_log_line {
                println!("last log line: {}", line.chars().take(200).collect::<String>());
            }
            Ok(())
        }
        Command::Kill { job } => {
            match controller.kill(&job)? {
                KillOutcome::Killed { pid } => println!("Killed agent (pid {pid})."),
                KillOutcome::AlreadyStopped => println!("Agent had already stopped."),
                KillOutcome::NotRunning => println!("No agent running for this job."),
            }
            Ok(())
        }
        Command::Prune {
            machine,
            local,
            workspace,
        } => {
            let target = target_arg(&controller, machine, local, workspace)?;
            let report = controller.prune(&target)?;
            for (job_id, pid) in &report.killed {
                println!("Killed {job_id} (pid {pid})");
            }
            for job_id in &report.cleared {
                println!("Cleared stale handle on {job_id}");
            }
            for (pid, args) in &report.zombies {
                println!("Killed untracked agent {pid}: {args}");
            }
            if report.killed.is_empty() && report.cleared.is_empty() && report.zombies.is_empty() {
                println!("Nothing to prune.");
            }
            Ok(())
        }
        Command::Clean {
            machine,
            local,
            keep,
            all,
            workspace,
        } => {
            let target = target_arg(&controller, machine, local, workspace)?;
            let report = controller.clean(&target, keep, all)?;
            for job_id in &report.removed {
                println!("Removed {job_id}");
            }
            for (job_id, reason) in &report.skipped {
                println!("Skipped {job_id}: {reason}");
            }
            if report.removed.is_empty() && report.skipped.is_empty() {
                println!("Nothing to clean.");
            }
            Ok(())
        }
        Command::Release { job } => {
            let manager = GpuDevReservations::new(&controller.config().reservation);
            match release_job(&controller, &manager, &job)? {
                Some(id) => println!("Released reservation {id}."),
                None => println!("Job holds no reservation."),
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_auto(
    controller: &Controller,
    task: TaskArgs,
    gpu_type: Option<String>,
    gpus: Option<u32>,
    hours: Option<f64>,
    no_pr: bool,
    agent: AgentArgs,
    follow: FollowArgs,
) -> Result<()> {
    let Some(spec) = task.spec() else {
        bail!("give --issue, -m or -i");
    };
    let config = controller.config();
    let mut reservation = ReservationRequest::from_config(&config.reservation);
    if let Some(gpu_type) = gpu_type {
        reservation.gpu_type = gpu_type;
    }
    if let Some(gpus) = gpus {
        reservation.gpu_count = gpus;
    }
    if let Some(hours) = hours {
        reservation.hours = hours;
    }
    let request = AutoRequest {
        task: resolve_task(spec)?,
        reservation,
        launch: launch_options(agent, &follow, !no_pr),
    };
    let issues = GhIssueSource {
        repo: config.repo.clone(),
    };
    let manager = GpuDevReservations::new(&config.reservation);
    let report = run_auto(controller, &issues, &manager, &request, &mut print_event)?;
    print_launch(&report.launch);
    if let Some(artifacts) = &report.artifacts {
        print_artifacts(artifacts);
    }
    if let Some(id) = &report.kept_reservation {
        println!(
            "Reservation {id} is still held. Run `ptq release {}` when done.",
            report.job.job_id
        );
    }
    Ok(())
}

fn launch_options(agent: AgentArgs, follow: &FollowArgs, create_pr: bool) -> LaunchOptions {
    LaunchOptions {
        follow: follow.enabled(),
        model: agent.model,
        max_turns: agent.max_turns,
        steering: agent.prompt,
        create_pr,
        wheel: WheelVariant::Detect,
    }
}

fn run_request(
    controller: &Controller,
    job_id: Option<String>,
    spec: Option<TaskSpec>,
    machine: Option<String>,
    local: bool,
    workspace: Option<String>,
) -> Result<RunRequest> {
    match (job_id, spec) {
        (Some(_), Some(_)) => bail!("give either a job id or a task, not both"),
        (Some(id), None) => {
            if machine.is_some() || local || workspace.is_some() {
                bail!("job {id} re-runs where it was created; drop --machine, --local and --workspace");
            }
            Ok(RunRequest::Job(id))
        }
        (None, Some(spec)) => Ok(RunRequest::Task {
            task: resolve_task(spec)?,
            target: target_arg(controller, machine, local, workspace)?,
        }),
        (None, None) => bail!("give a job id, --issue, -m or -i"),
    }
}

fn target_arg(
    controller: &Controller,
    machine: Option<String>,
    local: bool,
    workspace: Option<String>,
) -> Result<Target> {
    Ok(controller.target(machine_arg(machine, local)?, workspace))
}

fn machine_arg(machine: Option<String>, local: bool) -> Result<Machine> {
    match (machine, local) {
        (_, true) => Ok(Machine::Local),
        (Some(host), false) => Ok(Machine::from(host)),
        (None, false) => bail!("give a machine or --local"),
    }
}

fn print_event(line: &str) {
    if let Some(text) = render_event(line) {
        println!("{text}");
    }
}

fn print_launch(report: &LaunchReport) {
    let job = &report.job;
    match report.stream_end {
        None => {
            println!(
                "Launched {} run {} on {} (pid {}).",
                job.job_id,
                report.run_number,
                job.machine,
                job.process_handle.as_ref().map_or(0, |h| h.pid)
            );
            println!("Log: {}", report.log_path);
            println!("Follow with `ptq peek {}`.", job.job_id);
        }
        Some(StreamEnd::Exited) => println!("\n{} finished: {}", job.job_id, job.state),
        Some(StreamEnd::Detached) => println!(
            "\nStopped following {}; the agent keeps running. Check with `ptq status {}`.",
            job.job_id, job.job_id
        ),
    }
    if report.has_repro {
        println!("Repro script uploaded as repro.py.");
    }
}

fn print_artifacts(artifacts: &Artifacts) {
    match &artifacts.report {
        Some(report) => {
            println!("\n--- report ---");
            println!("{}", report.trim_end());
        }
        None => println!("\n(no report)"),
    }
    if artifacts.has_diff() {
        println!("\n--- diff ---");
        println!("{}", artifacts.diff.as_deref().unwrap_or("").trim_end());
        println!("\nApply with `ptq apply` or `git apply {}`.", artifacts.diff_path().display());
    } else {
        println!("\n(diff is empty)");
    }
    println!("\nArtifacts in {}", artifacts.dir.display());
}

fn live_label(status: &JobStatus) -> &'static str {
    match status.live {
        Some(live) => liveness_label(live),
        None => "unknown",
    }
}

fn print_status_line(status: &JobStatus) {
    let job = &status.job;
    println!(
        "{}  {}  {}  state={} ({})  runs={}",
        job.job_id,
        job.task.label(60),
        job.machine,
        job.state,
        live_label(status),
        job.run_count
    );
    if let Some(id) = &job.reservation_id {
        println!("reservation: {id}");
    }
}
