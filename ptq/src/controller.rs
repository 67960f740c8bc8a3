//! Lifecycle controller: the only code that changes a job's persisted state.
//!
//! Liveness is never trusted from the record. Every command that reports or
//! acts on a job re-probes the process on its target and settles a RUNNING
//! record whose process has died into COMPLETED or FAILED.
//!
//! Launches of one job are serialized by the store's per-job lock, held from
//! the liveness check until the new process handle is persisted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::events::summarize_event;
use crate::core::layout;
use crate::core::lifecycle::{Event, JobState, needs_settle, transition};
use crate::core::retention::{CleanCandidate, select_for_removal};
use crate::core::types::{JobRecord, Machine, ProcessHandle, Target, Task, TaskSpec};
use crate::error::{PtqError, Stage};
use crate::io::agent::{AgentInvocation, DetachedShell, ExternalTask, StartParams, StreamEnd};
use crate::io::apply::{ApplyOutcome, apply_diff, branch_name, copy_paste_commands};
use crate::io::backend::{self, Backend, sh_path};
use crate::io::config::{PtqConfig, load_config};
use crate::io::issue::{IssueData, IssueSource, extract_repro_script, format_issue_context};
use crate::io::job_store::JobStore;
use crate::io::paths::{PtqHome, expand_home};
use crate::io::prompt::{PromptInputs, agent_message, render_system_prompt};
use crate::io::results::{self, Artifacts};
use crate::io::skills;
use crate::io::workspace::{self, EnsureOutcome, SetupOptions, WheelVariant};
use crate::io::worktree;

/// Per-invocation knobs for a launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub follow: bool,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// Steering text appended to the prompt for this run.
    pub steering: Option<String>,
    pub create_pr: bool,
    /// Wheel index used if the workspace still needs provisioning.
    pub wheel: WheelVariant,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            follow: true,
            model: None,
            max_turns: None,
            steering: None,
            create_pr: false,
            wheel: WheelVariant::Detect,
        }
    }
}

/// What `run` should launch.
#[derive(Debug, Clone)]
pub enum RunRequest {
    /// Re-run a named job (id or issue number).
    Job(String),
    /// Reuse the newest job with this identity on the target, or create one.
    Task { task: Task, target: Target },
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub job: JobRecord,
    pub run_number: u32,
    pub log_path: String,
    pub has_repro: bool,
    /// `None` when not following.
    pub stream_end: Option<StreamEnd>,
}

/// A record plus a fresh liveness probe (`None` if the target was unreachable).
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: JobRecord,
    pub live: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: JobStatus,
    pub last_log_line: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeekReport {
    pub status: JobStatus,
    pub worklog: Option<String>,
    pub log_summaries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    Killed { pid: u32 },
    AlreadyStopped,
    NotRunning,
}

#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub removed: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub killed: Vec<(String, u32)>,
    pub cleared: Vec<String>,
    pub zombies: Vec<(u32, String)>,
}

pub struct Controller {
    config: PtqConfig,
    store: JobStore,
}

impl Controller {
    pub fn new(home: PtqHome, config: PtqConfig) -> Self {
        Self {
            config,
            store: JobStore::new(home),
        }
    }

    /// Controller over `$PTQ_HOME` (or `~/.ptq`) and its config file.
    pub fn open() -> Result<Self> {
        let home = PtqHome::resolve()?;
        let config = load_config(&home.config_path())?;
        Ok(Self::new(home, config))
    }

    pub fn config(&self) -> &PtqConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Target for `machine`, with the configured workspace unless overridden.
    pub fn target(&self, machine: Machine, workspace: Option<String>) -> Target {
        let workspace =
            workspace.unwrap_or_else(|| self.config.workspace_for(&machine).to_string());
        Target { machine, workspace }
    }

    fn backend(&self, target: &Target) -> Box<dyn Backend> {
        backend::connect(target, &self.config)
    }

    fn shell<'a>(&self, backend: &'a dyn Backend) -> DetachedShell<'a> {
        DetachedShell::new(backend, self.config.follow_poll())
    }

    /// Provision the workspace on `target` and deploy the helper scripts.
    pub fn setup(&self, target: &Target, wheel: WheelVariant) -> Result<EnsureOutcome> {
        let backend = self.backend(target);
        let opts = SetupOptions::from_config(&self.config, wheel);
        let outcome = workspace::ensure(backend.as_ref(), &opts).context(Stage::Provision)?;
        skills::deploy(backend.as_ref(), &self.skills_dir()?).context(Stage::Provision)?;
        Ok(outcome)
    }

    /// Local directory holding the helper scripts.
    pub fn skills_dir(&self) -> Result<PathBuf> {
        match &self.config.skills_dir {
            Some(dir) => expand_home(dir),
            None => Ok(self.store.home().skills_dir()),
        }
    }

    pub fn create_job(&self, task: Task, target: &Target) -> Result<JobRecord> {
        self.store.create(task, target, Utc::now())
    }

    /// Fetch the issue behind an issue task.
    pub fn fetch_issue<I: IssueSource>(&self, issues: &I, task: &Task) -> Result<Option<IssueData>> {
        let Some(number) = task.issue_number else {
            return Ok(None);
        };
        let issue = issues
            .fetch(number)
            .with_context(|| format!("issue #{number}"))
            .context(Stage::FetchIssue)?;
        Ok(Some(issue))
    }

    /// `run`: fetch the issue first, then reuse or create the job and launch it.
    pub fn run<I: IssueSource>(
        &self,
        issues: &I,
        request: RunRequest,
        opts: &LaunchOptions,
        sink: &mut dyn FnMut(&str),
    ) -> Result<LaunchReport> {
        let (task, existing, target) = match request {
            RunRequest::Job(id) => {
                let job = self.store.resolve(&id)?;
                (job.task.clone(), Some(job.job_id.clone()), job.target())
            }
            RunRequest::Task { task, target } => (task, None, target),
        };
        let issue = self.fetch_issue(issues, &task)?;
        let job_id = match existing {
            Some(id) => id,
            None => match self.store.find_existing(&task, &target)? {
                Some(job) => {
                    info!(job_id = %job.job_id, "reusing existing job");
                    job.job_id
                }
                None => self.create_job(task, &target)?.job_id,
            },
        };
        self.launch(&job_id, opts, issue.as_ref(), sink)
    }

    /// Start a new run of `job_id`.
    ///
    /// Rejects with [`PtqError::AlreadyRunning`] when the recorded process is
    /// alive, leaving the record untouched. Provisioning failures mark the job
    /// FAILED and surface as `provision failed`; a process that could not be
    /// started at all surfaces as `launch failed`.
    #[instrument(skip_all, fields(job_id))]
    pub fn launch(
        &self,
        job_id: &str,
        opts: &LaunchOptions,
        issue: Option<&IssueData>,
        sink: &mut dyn FnMut(&str),
    ) -> Result<LaunchReport> {
        let lock = self.store.lock(job_id)?;
        let mut job = self.store.load(job_id)?;
        let target = job.target();
        let backend = self.backend(&target);
        let shell = self.shell(backend.as_ref());

        if let Some(handle) = &job.process_handle
            && shell.is_live(handle)?
        {
            return Err(PtqError::AlreadyRunning {
                job_id: job.job_id.clone(),
                pid: handle.pid,
            }
            .into());
        }
        match job.state {
            JobState::Running => self.settle_dead(backend.as_ref(), &mut job)?,
            JobState::Provisioning => {
                // We hold the lock, so whoever left this behind is gone.
                warn!("recovering job stuck in provisioning");
                job.state = transition(job.state, Event::ProvisioningFailed)?;
                self.store.update(&job)?;
            }
            _ => {}
        }

        job.state = transition(job.state, Event::BeginProvisioning)?;
        job.process_handle = None;
        self.store.update(&job)?;

        let run_number = job.run_count + 1;
        let prepared = match self.prepare_run(backend.as_ref(), &job, run_number, opts, issue) {
            Ok(prepared) => prepared,
            Err(err) => {
                job.state = transition(job.state, Event::ProvisioningFailed)?;
                self.store.update(&job)?;
                return Err(err.context(Stage::Provision));
            }
        };

        // Counted before the process is confirmed, so a failed start still
        // leaves its (empty) log number behind.
        job.run_count = run_number;
        self.store.update(&job)?;

        let log_path = layout::log_file(&target.workspace, &job.job_id, run_number);
        let params = StartParams {
            command: prepared.command,
            log_path: log_path.clone(),
            signature: layout::process_signature(&job.job_id),
        };
        let handle = match shell.start(&params) {
            Ok(handle) => handle,
            Err(err) => {
                job.process_handle = None;
                job.state = transition(job.state, Event::LaunchFailed)?;
                self.store.update(&job)?;
                return Err(err.context(Stage::Launch));
            }
        };
        job.process_handle = Some(handle.clone());
        job.state = transition(job.state, Event::Launched)?;
        self.store.update(&job)?;
        drop(lock);
        info!(run = run_number, pid = handle.pid, "agent launched");

        let mut report = LaunchReport {
            job,
            run_number,
            log_path,
            has_repro: prepared.has_repro,
            stream_end: None,
        };
        if !opts.follow {
            return Ok(report);
        }

        let end = shell.stream_output(&handle, &report.log_path, sink)?;
        report.stream_end = Some(end);
        if end == StreamEnd::Exited {
            report.job = self.settle_after_follow(backend.as_ref(), job_id, &handle)?;
        }
        Ok(report)
    }

    /// Workspace, skills, worktree, prompt and repro upload for one run.
    fn prepare_run(
        &self,
        backend: &dyn Backend,
        job: &JobRecord,
        run_number: u32,
        opts: &LaunchOptions,
        issue: Option<&IssueData>,
    ) -> Result<PreparedRun> {
        let ws = &job.workspace;
        let setup = SetupOptions::from_config(&self.config, opts.wheel.clone());
        workspace::ensure(backend, &setup)?;
        let deployed = skills::deploy(backend, &self.skills_dir()?)?;
        let worktree = worktree::acquire(backend, &job.job_id)?;
        let job_dir = layout::job_dir(ws, &job.job_id);

        let issue_context = match (job.task.issue_number, issue) {
            (Some(number), Some(issue)) => Some(format_issue_context(issue, number)),
            _ => None,
        };
        let repro = issue.and_then(extract_repro_script);
        let has_repro = match &repro {
            Some(script) => {
                upload_text(backend, script, &layout::join(&job_dir, layout::REPRO_FILE))?;
                true
            }
            None => backend.test_path("-f", &layout::join(&job_dir, layout::REPRO_FILE))?,
        };

        let prompt = render_system_prompt(&PromptInputs {
            job_id: &job.job_id,
            workspace: ws,
            run_number,
            task: &job.task,
            issue_context: issue_context.as_deref(),
            has_repro,
            create_pr: opts.create_pr,
            repo: &self.config.repo,
            steering: opts.steering.as_deref(),
            skills: &deployed,
        })?;
        let prompt_file = layout::join(&job_dir, layout::SYSTEM_PROMPT_FILE);
        upload_text(backend, &prompt, &prompt_file)?;

        let mut agent = self.config.agent.clone();
        if let Some(model) = &opts.model {
            agent.model = model.clone();
        }
        if let Some(max_turns) = opts.max_turns {
            agent.max_turns = max_turns;
        }
        let command = AgentInvocation {
            agent: &agent,
            message: agent_message(&job.task),
            worktree: &worktree,
            prompt_file: &prompt_file,
            line_buffered: !job.machine.is_local(),
        }
        .command_line();
        debug!(command, "agent command");
        Ok(PreparedRun { command, has_repro })
    }

    fn settle_after_follow(
        &self,
        backend: &dyn Backend,
        job_id: &str,
        handle: &ProcessHandle,
    ) -> Result<JobRecord> {
        let _lock = self.store.lock(job_id)?;
        let mut job = self.store.load(job_id)?;
        if job.state == JobState::Running && job.process_handle.as_ref() == Some(handle) {
            self.settle_dead(backend, &mut job)?;
        }
        Ok(job)
    }

    /// Settle a RUNNING record whose process is gone. Caller holds the lock.
    fn settle_dead(&self, backend: &dyn Backend, job: &mut JobRecord) -> Result<()> {
        let live = match &job.process_handle {
            Some(handle) => self.shell(backend).is_live(handle)?,
            None => false,
        };
        if !needs_settle(job.state, live) {
            return Ok(());
        }
        let presence = results::presence(backend, job)?;
        job.state = transition(job.state, Event::Exited(presence))?;
        job.process_handle = None;
        self.store.update(job)?;
        info!(job_id = %job.job_id, state = %job.state, "run settled");
        Ok(())
    }

    /// Probe a job and settle it if its process died. Never fails on an
    /// unreachable target; the status then carries `live: None`.
    pub fn refresh(&self, job: JobRecord) -> JobStatus {
        let backend = self.backend(&job.target());
        match self.refresh_with(backend.as_ref(), job.clone()) {
            Ok(status) => status,
            Err(err) => {
                warn!(job_id = %job.job_id, err = %format!("{err:#}"), "liveness probe failed");
                JobStatus { job, live: None }
            }
        }
    }

    fn refresh_with(&self, backend: &dyn Backend, job: JobRecord) -> Result<JobStatus> {
        let live = match &job.process_handle {
            Some(handle) => self.shell(backend).is_live(handle)?,
            None => false,
        };
        if !needs_settle(job.state, live) {
            return Ok(JobStatus {
                job,
                live: Some(live),
            });
        }
        // A launch in progress owns the record; report what we saw.
        let Ok(_lock) = self.store.lock(&job.job_id) else {
            return Ok(JobStatus {
                job,
                live: Some(live),
            });
        };
        let mut job = self.store.load(&job.job_id)?;
        self.settle_dead(backend, &mut job)?;
        let live = job.state == JobState::Running;
        Ok(JobStatus {
            job,
            live: Some(live),
        })
    }

    /// All jobs, oldest first, refreshed.
    pub fn list(&self) -> Result<Vec<JobStatus>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|job| self.refresh(job))
            .collect())
    }

    pub fn status(&self, id_or_issue: &str) -> Result<StatusReport> {
        let status = self.refresh(self.store.resolve(id_or_issue)?);
        let job = &status.job;
        let backend = self.backend(&job.target());
        let last_log_line = if job.run_count == 0 {
            None
        } else {
            let log = layout::log_file(&job.workspace, &job.job_id, job.run_count);
            backend
                .run(&format!("tail -n 1 {} 2>/dev/null", sh_path(&log)))
                .ok()
                .map(|out| out.stdout_lossy().trim().to_string())
                .filter(|line| !line.is_empty())
        };
        Ok(StatusReport {
            status,
            last_log_line,
        })
    }

    /// Status, worklog and the last `log_lines` log events summarized.
    pub fn peek(&self, id_or_issue: &str, log_lines: usize) -> Result<PeekReport> {
        let status = self.refresh(self.store.resolve(id_or_issue)?);
        let job = &status.job;
        let backend = self.backend(&job.target());
        let job_dir = layout::job_dir(&job.workspace, &job.job_id);
        let worklog = backend
            .read_file(&layout::join(&job_dir, layout::WORKLOG_FILE))?
            .filter(|w| !w.trim().is_empty());
        let mut log_summaries = Vec::new();
        if log_lines > 0 && job.run_count > 0 {
            let log = layout::log_file(&job.workspace, &job.job_id, job.run_count);
            let out = backend.run(&format!("tail -n {log_lines} {} 2>/dev/null", sh_path(&log)))?;
            for line in out.stdout_lossy().lines() {
                log_summaries.extend(summarize_event(line));
            }
        }
        Ok(PeekReport {
            status,
            worklog,
            log_summaries,
        })
    }

    /// Terminate the job's agent and its whole process tree.
    #[instrument(skip_all, fields(id_or_issue))]
    pub fn kill(&self, id_or_issue: &str) -> Result<KillOutcome> {
        let job = self.store.resolve(id_or_issue)?;
        let _lock = self.store.lock(&job.job_id)?;
        let mut job = self.store.load(&job.job_id)?;
        let backend = self.backend(&job.target());
        let outcome = self.kill_locked(backend.as_ref(), &mut job)?;
        Ok(outcome)
    }

    fn kill_locked(&self, backend: &dyn Backend, job: &mut JobRecord) -> Result<KillOutcome> {
        let Some(handle) = job.process_handle.clone() else {
            return Ok(KillOutcome::NotRunning);
        };
        let shell = self.shell(backend);
        if !shell.is_live(&handle)? {
            if job.state == JobState::Running {
                self.settle_dead(backend, job)?;
            } else {
                job.process_handle = None;
                self.store.update(job)?;
            }
            return Ok(KillOutcome::AlreadyStopped);
        }
        shell.terminate(&handle)?;
        job.state = transition(job.state, Event::Killed)?;
        job.process_handle = None;
        self.store.update(job)?;
        info!(job_id = %job.job_id, pid = handle.pid, "agent killed");
        Ok(KillOutcome::Killed { pid: handle.pid })
    }

    /// Remove old jobs on `target`: worktree, branch, job directory and record.
    ///
    /// Running jobs are skipped unless `all` is set, in which case they are
    /// killed first. The `keep` most recent eligible jobs survive either way.
    #[instrument(skip_all, fields(machine = %target.machine, keep, all))]
    pub fn clean(&self, target: &Target, keep: usize, all: bool) -> Result<CleanReport> {
        let backend = self.backend(target);
        let jobs: Vec<JobRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|j| j.machine == target.machine && j.workspace == target.workspace)
            .collect();
        let mut candidates = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let running = match &job.process_handle {
                Some(handle) => self.shell(backend.as_ref()).is_live(handle)?,
                None => job.state == JobState::Provisioning,
            };
            candidates.push(CleanCandidate {
                job_id: job.job_id.clone(),
                created_at: job.created_at,
                running,
            });
        }

        let mut report = CleanReport::default();
        for job_id in select_for_removal(&candidates, keep, all) {
            match self.clean_one(backend.as_ref(), &job_id) {
                Ok(()) => report.removed.push(job_id),
                Err(err) => {
                    warn!(job_id, err = %format!("{err:#}"), "clean skipped job");
                    report.skipped.push((job_id, format!("{err:#}")));
                }
            }
        }
        if !report.removed.is_empty() {
            let base = sh_path(&layout::base_checkout(&target.workspace));
            backend.run(&format!("test -e {base}/.git && git -C {base} worktree prune"))?;
        }
        Ok(report)
    }

    fn clean_one(&self, backend: &dyn Backend, job_id: &str) -> Result<()> {
        let _lock = self.store.lock(job_id)?;
        let mut job = self.store.load(job_id)?;
        if let Some(reservation) = &job.reservation_id {
            return Err(anyhow::anyhow!(
                "job holds reservation {reservation}; run `ptq release {job_id}` first"
            ));
        }
        if job.process_handle.is_some() {
            self.kill_locked(backend, &mut job)?;
        }
        let cleaned = transition(job.state, Event::Cleaned)?;
        worktree::release(backend, job_id)?;
        backend.run_checked(
            &format!("rm -rf {}", sh_path(&layout::job_dir(&job.workspace, job_id))),
            "remove job directory",
        )?;
        self.store.remove(job_id)?;
        debug!(job_id, state = %cleaned, "job cleaned");
        Ok(())
    }

    /// Kill every tracked agent on `target`, clear stale handles, then kill
    /// untracked agent processes working in the target's workspace.
    #[instrument(skip_all, fields(machine = %target.machine))]
    pub fn prune(&self, target: &Target) -> Result<PruneReport> {
        let backend = self.backend(target);
        let mut report = PruneReport::default();
        let mut tracked = Vec::new();
        for job in self.store.list()? {
            if job.machine != target.machine || job.workspace != target.workspace {
                continue;
            }
            let Some(handle) = job.process_handle.clone() else {
                continue;
            };
            tracked.push(handle.pid);
            let Ok(_lock) = self.store.lock(&job.job_id) else {
                warn!(job_id = %job.job_id, "launch in progress, not pruning");
                continue;
            };
            let mut job = self.store.load(&job.job_id)?;
            match self.kill_locked(backend.as_ref(), &mut job)? {
                KillOutcome::Killed { pid } => report.killed.push((job.job_id.clone(), pid)),
                KillOutcome::AlreadyStopped => report.cleared.push(job.job_id.clone()),
                KillOutcome::NotRunning => {}
            }
        }

        let marker = workspace_marker(&target.workspace);
        let program = &self.config.agent.program;
        let out = backend.run_checked("ps -eo pid=,args=", "list processes")?;
        for (pid, args) in untracked_agents(&out, &marker, program, &tracked) {
            let handle = ProcessHandle {
                pid,
                signature: marker.clone(),
            };
            self.shell(backend.as_ref()).terminate(&handle)?;
            report.zombies.push((pid, args));
        }
        Ok(report)
    }

    /// Fetch artifacts into `~/.ptq/results/<job_id>/`.
    pub fn fetch_results(&self, id_or_issue: &str) -> Result<(JobRecord, Artifacts)> {
        let job = self.store.resolve(id_or_issue)?;
        let backend = self.backend(&job.target());
        let dest = self.store.home().results_dir(&job.job_id);
        let artifacts =
            results::fetch(backend.as_ref(), &job, &dest).context(Stage::FetchResults)?;
        Ok((job, artifacts))
    }

    /// Apply a job's diff to a local checkout on `ptq/<issue>` (or
    /// `ptq/<job_id>`). Fetches the diff first if it was never downloaded.
    pub fn apply(&self, id_or_issue: &str, checkout: &Path) -> Result<(ApplyOutcome, String)> {
        let job = self.store.resolve(id_or_issue)?;
        let diff = self.local_diff(&job)?;
        let branch = branch_name(&job.task, &job.job_id);
        let outcome = apply_diff(checkout, &diff, &branch).context(Stage::Apply)?;
        Ok((outcome, copy_paste_commands(checkout, &branch, &job.task, &job.job_id)))
    }

    fn local_diff(&self, job: &JobRecord) -> Result<PathBuf> {
        let dest = self.store.home().results_dir(&job.job_id);
        let diff = dest.join(layout::DIFF_FILE);
        if !diff.exists() {
            let backend = self.backend(&job.target());
            let remote = layout::join(&layout::job_dir(&job.workspace, &job.job_id), layout::DIFF_FILE);
            if backend.test_path("-f", &remote).context(Stage::FetchResults)? {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("create directory {}", dest.display()))?;
                backend
                    .copy_from(&remote, &diff)
                    .context(Stage::FetchResults)?;
            }
        }
        let has_content = fs::read_to_string(&diff)
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false);
        if !has_content {
            return Err(PtqError::NoDiff(job.job_id.clone()).into());
        }
        Ok(diff)
    }
}

struct PreparedRun {
    command: String,
    has_repro: bool,
}

/// Resolve a task spec once into a normalized task.
pub fn resolve_task(spec: TaskSpec) -> Result<Task> {
    match spec {
        TaskSpec::Issue(number) => Ok(Task::issue(number)),
        TaskSpec::Freeform(text) => {
            if text.trim().is_empty() {
                return Err(PtqError::InvalidTask("task text is empty".to_string()).into());
            }
            Ok(Task::freeform(text.trim()))
        }
        TaskSpec::FromFile(path) => {
            let text = fs::read_to_string(&path).map_err(|_| {
                PtqError::InvalidTask(format!("file not found: {}", path.display()))
            })?;
            if text.trim().is_empty() {
                return Err(
                    PtqError::InvalidTask(format!("file is empty: {}", path.display())).into(),
                );
            }
            Ok(Task::freeform(text.trim()))
        }
    }
}

fn upload_text(backend: &dyn Backend, contents: &str, dest: &str) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new().context("create temp file")?;
    tmp.write_all(contents.as_bytes())
        .context("write temp file")?;
    tmp.flush().context("flush temp file")?;
    backend
        .copy_to(tmp.path(), dest)
        .with_context(|| format!("upload {dest}"))
}

/// Substring present in every agent command line launched in `workspace`.
fn workspace_marker(workspace: &str) -> String {
    let rel = workspace.strip_prefix("~/").unwrap_or(workspace);
    format!("{}/jobs/", rel.trim_end_matches('/'))
}

/// `(pid, args)` of agent processes in `ps -eo pid=,args=` output that carry
/// the workspace marker and are not tracked.
fn untracked_agents(ps: &str, marker: &str, program: &str, tracked: &[u32]) -> Vec<(u32, String)> {
    ps.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            let args = args.trim();
            (args.contains(marker) && args.contains(program) && !tracked.contains(&pid))
                .then(|| (pid, args.chars().take(100).collect()))
        })
        .collect()
}
