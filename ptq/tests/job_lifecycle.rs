//! End-to-end lifecycle tests against a local workspace.
//!
//! Each test gets its own ptq home and a workspace that already looks
//! provisioned (git base checkout, venv python, setup marker). The agent is a
//! small shell script, so launches, liveness probes, kills and artifact
//! fetches all run for real through `sh`, `ps` and `git`.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};

use ptq::controller::{KillOutcome, LaunchOptions, RunRequest};
use ptq::core::layout;
use ptq::core::lifecycle::JobState;
use ptq::core::types::Task;
use ptq::error::PtqError;
use ptq::exit_codes;
use ptq::io::agent::StreamEnd;
use ptq::io::job_store::JobStore;
use ptq::test_support::{
    AgentBehavior, FIXED_FILE, HANG_DESCENDANTS, HANG_PIDS_FILE, StaticIssues, TestEnv, git,
    pid_alive, process_running, recorded_pids, sample_issue,
};

fn no_follow() -> LaunchOptions {
    LaunchOptions {
        follow: false,
        ..LaunchOptions::default()
    }
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(50));
    }
}

/// Verifies the issue flow: launch, stream, settle COMPLETED, fetch both
/// artifacts, apply onto `ptq/12345` in a local checkout.
#[test]
fn issue_job_runs_to_applied_branch() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let issues = StaticIssues::default().with(12345, sample_issue());

    let mut lines = Vec::new();
    let report = controller
        .run(
            &issues,
            RunRequest::Task {
                task: Task::issue(12345),
                target: env.local_target(),
            },
            &LaunchOptions::default(),
            &mut |line: &str| lines.push(line.to_string()),
        )
        .expect("run");

    assert_eq!(report.stream_end, Some(StreamEnd::Exited));
    assert_eq!(report.run_number, 1);
    assert!(report.has_repro);
    assert_eq!(report.job.state, JobState::Completed);
    assert!(report.job.process_handle.is_none());
    assert!(lines.iter().any(|l| l.contains("Looking at the issue")));

    let job_dir = env.workspace().join("jobs").join(&report.job.job_id);
    let repro = fs::read_to_string(job_dir.join(layout::REPRO_FILE)).expect("repro");
    assert!(repro.contains("import torch"));
    assert!(job_dir.join(layout::log_file_name(1)).exists());

    let (job, artifacts) = controller.fetch_results("12345").expect("fetch");
    assert_eq!(job.job_id, report.job.job_id);
    assert!(artifacts.report.as_deref().is_some_and(|r| r.contains("Fixed add")));
    assert!(artifacts.has_diff());
    assert_eq!(artifacts.logs.len(), 1);

    let checkout = env.local_checkout().expect("checkout");
    let (outcome, commands) = controller.apply("12345", &checkout).expect("apply");
    assert_eq!(outcome.branch, "ptq/12345");
    assert!(outcome.created_branch);
    assert!(commands.contains("git push -u origin ptq/12345"));
    let branch = git(&checkout, &["branch", "--show-current"]).expect("branch");
    assert_eq!(branch.trim(), "ptq/12345");
    let applied = fs::read_to_string(checkout.join(FIXED_FILE)).expect("read");
    assert!(applied.contains("# fixed"));
}

/// Verifies skills from the ptq home reach the workspace on launch and are
/// listed in the system prompt.
#[test]
fn launch_deploys_skills_into_workspace() {
    let env = TestEnv::new().expect("env");
    let skills = env.home.skills_dir();
    fs::create_dir_all(&skills).expect("skills dir");
    fs::write(skills.join("rebuild.sh"), "#!/bin/sh\necho rebuilt\n").expect("write skill");
    let controller = env.controller();

    let report = controller
        .run(
            &StaticIssues::default(),
            RunRequest::Task {
                task: Task::freeform("Rebuild and rerun the conv test"),
                target: env.local_target(),
            },
            &no_follow(),
            &mut |_: &str| {},
        )
        .expect("run");

    let deployed = env.workspace().join(layout::SCRIPTS_DIR).join("rebuild.sh");
    let out = std::process::Command::new(&deployed).output().expect("run skill");
    assert_eq!(String::from_utf8_lossy(&out.stdout), "rebuilt\n");

    let prompt = fs::read_to_string(
        env.workspace()
            .join("jobs")
            .join(&report.job.job_id)
            .join(layout::SYSTEM_PROMPT_FILE),
    )
    .expect("prompt");
    assert!(prompt.contains(&format!("{}/scripts/rebuild.sh", env.config.local_workspace)));
    wait_for("agent to exit", || {
        controller.status(&report.job.job_id).expect("status").status.job.state != JobState::Running
    });
}

/// Verifies a second run reuses the worktree without touching its edits.
#[test]
fn rerun_preserves_worktree_edits() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let issues = StaticIssues::default();
    let task = Task::freeform("Profile the conv kernel");

    let first = controller
        .run(
            &issues,
            RunRequest::Task {
                task: task.clone(),
                target: env.local_target(),
            },
            &LaunchOptions::default(),
            &mut |_: &str| {},
        )
        .expect("first run");
    let job_id = first.job.job_id.clone();
    let scratch = env.worktree(&job_id).join("scratch.py");
    fs::write(&scratch, "x = torch.ones(3)\n").expect("edit");

    // Same identity on the same machine: the job is reused, not recreated.
    let second = controller
        .run(
            &issues,
            RunRequest::Task {
                task,
                target: env.local_target(),
            },
            &LaunchOptions::default(),
            &mut |_: &str| {},
        )
        .expect("second run");
    assert_eq!(second.job.job_id, job_id);
    assert_eq!(second.run_number, 2);
    assert_eq!(
        fs::read_to_string(&scratch).expect("scratch survives"),
        "x = torch.ones(3)\n"
    );
    let job_dir = env.workspace().join("jobs").join(&job_id);
    assert!(job_dir.join(layout::log_file_name(1)).exists());
    assert!(job_dir.join(layout::log_file_name(2)).exists());
    assert_eq!(controller.store().list().expect("list").len(), 1);
}

/// Verifies launching a live job is rejected and leaves its handle alone.
#[test]
fn second_launch_of_running_job_is_rejected() {
    let mut env = TestEnv::new().expect("env");
    env.set_agent(AgentBehavior::Hang).expect("agent");
    let controller = env.controller();
    let job = controller
        .create_job(Task::freeform("hang forever"), &env.local_target())
        .expect("create");

    let first = controller
        .launch(&job.job_id, &no_follow(), None, &mut |_: &str| {})
        .expect("launch");
    let handle = first.job.process_handle.clone().expect("handle");

    let err = controller
        .launch(&job.job_id, &no_follow(), None, &mut |_: &str| {})
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PtqError>(),
        Some(PtqError::AlreadyRunning { pid, .. }) if *pid == handle.pid
    ));
    assert_eq!(exit_codes::for_error(&err), exit_codes::ALREADY_RUNNING);

    let stored = controller.store().load(&job.job_id).expect("load");
    assert_eq!(stored.process_handle.as_ref(), Some(&handle));
    assert_eq!(stored.run_count, 1);
    assert_eq!(stored.state, JobState::Running);

    controller.kill(&job.job_id).expect("cleanup kill");
}

/// Verifies kill takes down the agent and every child it spawned.
#[test]
fn kill_leaves_no_descendants() {
    let mut env = TestEnv::new().expect("env");
    env.set_agent(AgentBehavior::Hang).expect("agent");
    let program = env.config.agent.program.clone();
    let controller = env.controller();
    let job = controller
        .create_job(Task::freeform("spawn children"), &env.local_target())
        .expect("create");
    let launched = controller
        .launch(&job.job_id, &no_follow(), None, &mut |_: &str| {})
        .expect("launch");
    let agent_pid = launched.job.process_handle.expect("handle").pid;
    let pids_file = env
        .worktree(&job.job_id)
        .parent()
        .expect("job dir")
        .join(HANG_PIDS_FILE);
    wait_for("agent descendants", || {
        recorded_pids(&pids_file).len() == HANG_DESCENDANTS
    });
    let descendants = recorded_pids(&pids_file);
    assert!(descendants.iter().all(|pid| pid_alive(*pid)));

    let outcome = controller.kill(&job.job_id).expect("kill");
    assert!(matches!(outcome, KillOutcome::Killed { .. }));
    // Includes the grandchild that left the agent's session via setsid.
    wait_for("agent and descendants to exit", || {
        !pid_alive(agent_pid) && descendants.iter().all(|pid| !pid_alive(*pid))
    });
    assert!(!process_running(&program));

    let stored = controller.store().load(&job.job_id).expect("load");
    assert!(stored.process_handle.is_none());
    assert_eq!(stored.state, JobState::Killed);

    assert_eq!(controller.kill(&job.job_id).expect("kill again"), KillOutcome::NotRunning);
}

/// Verifies an agent exiting without artifacts settles as FAILED and stays
/// re-launchable.
#[test]
fn exit_without_artifacts_is_failed() {
    let mut env = TestEnv::new().expect("env");
    env.set_agent(AgentBehavior::Fail).expect("agent");
    let controller = env.controller();
    let job = controller
        .create_job(Task::freeform("crash"), &env.local_target())
        .expect("create");

    let report = controller
        .launch(&job.job_id, &LaunchOptions::default(), None, &mut |_: &str| {})
        .expect("launch");
    assert_eq!(report.job.state, JobState::Failed);

    let (_, artifacts) = controller.fetch_results(&job.job_id).expect("fetch");
    assert!(artifacts.report.is_none());
    assert!(!artifacts.has_diff());
    let apply = controller
        .apply(&job.job_id, &env.local_checkout().expect("checkout"))
        .unwrap_err();
    assert!(matches!(apply.downcast_ref::<PtqError>(), Some(PtqError::NoDiff(_))));

    env.set_agent(AgentBehavior::Finish).expect("agent");
    let rerun = env
        .controller()
        .launch(&job.job_id, &LaunchOptions::default(), None, &mut |_: &str| {})
        .expect("relaunch");
    assert_eq!(rerun.job.state, JobState::Completed);
    assert_eq!(rerun.run_number, 2);
}

/// Verifies a RUNNING record whose process died is settled on the next read.
#[test]
fn status_settles_finished_no_follow_run() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let job = controller
        .create_job(Task::freeform("quick fix"), &env.local_target())
        .expect("create");
    controller
        .launch(&job.job_id, &no_follow(), None, &mut |_: &str| {})
        .expect("launch");

    wait_for("job to settle", || {
        controller
            .status(&job.job_id)
            .map(|s| s.status.job.state == JobState::Completed)
            .unwrap_or(false)
    });
    let status = controller.status(&job.job_id).expect("status");
    assert_eq!(status.status.live, Some(false));
    assert!(status.status.job.process_handle.is_none());

    let peek = controller.peek(&job.job_id, 20).expect("peek");
    assert!(peek.worklog.as_deref().is_some_and(|w| w.contains("reproduced")));
    assert!(peek.log_summaries.iter().any(|s| s == "Bash"));
    assert!(peek.log_summaries.iter().any(|s| s == "Looking at the issue"));
}

/// Verifies `clean --keep 1` removes all but the newest stopped job and
/// never touches a running one.
#[test]
fn clean_keeps_newest_and_skips_running() {
    let mut env = TestEnv::new().expect("env");
    env.set_agent(AgentBehavior::Hang).expect("agent");
    let controller = env.controller();
    let target = env.local_target();
    let store = controller.store();
    let at = |minute| Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap();
    let oldest = store.create(Task::freeform("a"), &target, at(1)).expect("a");
    let middle = store.create(Task::freeform("b"), &target, at(2)).expect("b");
    let newest = store.create(Task::freeform("c"), &target, at(3)).expect("c");
    let running = store.create(Task::freeform("d"), &target, at(0)).expect("d");
    controller
        .launch(&running.job_id, &no_follow(), None, &mut |_: &str| {})
        .expect("launch");

    let report = controller.clean(&target, 1, false).expect("clean");
    let mut removed = report.removed.clone();
    removed.sort();
    let mut expected = vec![oldest.job_id.clone(), middle.job_id.clone()];
    expected.sort();
    assert_eq!(removed, expected);

    let left: Vec<String> = store
        .list()
        .expect("list")
        .into_iter()
        .map(|j| j.job_id)
        .collect();
    assert!(left.contains(&newest.job_id));
    assert!(left.contains(&running.job_id));
    assert!(env.worktree(&running.job_id).exists());

    let all = controller.clean(&target, 0, true).expect("clean all");
    assert_eq!(all.removed.len(), 2);
    assert!(store.list().expect("list").is_empty());
    assert!(!env.worktree(&running.job_id).exists());
    let base = env.workspace().join(layout::BASE_CHECKOUT);
    let branches = git(&base, &["branch", "--list", "ptq-job/*"]).expect("branches");
    assert!(branches.trim().is_empty(), "leftover branches: {branches}");
}

/// Verifies a freeform job has no issue number and lists by its text.
#[test]
fn freeform_job_lists_task_text() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let job = controller
        .create_job(
            Task::freeform("Investigate flaky conv test"),
            &env.local_target(),
        )
        .expect("create");
    assert_eq!(job.task.issue_number, None);
    assert!(job.job_id.contains("-adhoc-"));

    let listed = controller.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].job.task.label(40), "Investigate flaky conv test");
    assert_eq!(listed[0].live, Some(false));
}

/// Verifies results for a job whose directory never existed fail as not found.
#[test]
fn results_without_job_directory_is_not_found() {
    let env = TestEnv::new().expect("env");
    let controller = env.controller();
    let job = controller
        .create_job(Task::issue(777), &env.local_target())
        .expect("create");
    let err = controller.fetch_results(&job.job_id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PtqError>(),
        Some(PtqError::JobDirMissing { .. })
    ));
    assert_eq!(exit_codes::for_error(&err), exit_codes::NOT_FOUND);
}

/// Verifies concurrent creators in one clock tick all get distinct ids.
#[test]
fn concurrent_same_tick_creation_yields_distinct_ids() {
    let env = TestEnv::new().expect("env");
    let target = env.local_target();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = JobStore::new(env.home.clone());
            let target = target.clone();
            thread::spawn(move || {
                store
                    .create(Task::issue(12345), &target, now)
                    .expect("create")
                    .job_id
            })
        })
        .collect();
    let mut ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}
