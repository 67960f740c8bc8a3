//! Target-side path layout.
//!
//! Paths are plain strings because they may live on another machine. A leading
//! `~/` is kept verbatim here; backends expand it when a path reaches a shell
//! or a copy.

/// Workspace-relative name of the shared base checkout.
pub const BASE_CHECKOUT: &str = "pytorch";
/// Marker written once provisioning finished; holds the pinned revision.
pub const SETUP_MARKER: &str = ".ptq_setup_complete";
/// Directory created with `mkdir` to serialize provisioning across processes.
pub const SETUP_LOCK: &str = ".ptq_setup.lock";

pub const SYSTEM_PROMPT_FILE: &str = "system_prompt.md";
pub const REPRO_FILE: &str = "repro.py";
pub const REPORT_FILE: &str = "report.md";
pub const DIFF_FILE: &str = "fix.diff";
pub const WORKLOG_FILE: &str = "worklog.md";
/// Workspace-relative directory the helper scripts are deployed to.
pub const SCRIPTS_DIR: &str = "scripts";

pub fn join(base: &str, rel: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

pub fn base_checkout(workspace: &str) -> String {
    join(workspace, BASE_CHECKOUT)
}

pub fn venv_dir(workspace: &str) -> String {
    join(workspace, ".venv")
}

pub fn venv_python(workspace: &str) -> String {
    join(workspace, ".venv/bin/python")
}

pub fn setup_marker(workspace: &str) -> String {
    join(workspace, SETUP_MARKER)
}

pub fn setup_lock(workspace: &str) -> String {
    join(workspace, SETUP_LOCK)
}

pub fn scripts_dir(workspace: &str) -> String {
    join(workspace, SCRIPTS_DIR)
}

pub fn jobs_dir(workspace: &str) -> String {
    join(workspace, "jobs")
}

pub fn job_dir(workspace: &str, job_id: &str) -> String {
    join(&jobs_dir(workspace), job_id)
}

/// The job's private worktree, inside its job directory.
pub fn worktree_dir(workspace: &str, job_id: &str) -> String {
    join(&job_dir(workspace, job_id), BASE_CHECKOUT)
}

/// Branch the worktree is checked out on.
pub fn worktree_branch(job_id: &str) -> String {
    format!("ptq-job/{job_id}")
}

pub fn log_file_name(run: u32) -> String {
    format!("claude-{run}.log")
}

pub fn log_file(workspace: &str, job_id: &str, run: u32) -> String {
    join(&job_dir(workspace, job_id), &log_file_name(run))
}

/// Substring of the agent's command line that ties a process to its job.
/// The trailing slash keeps `jobs/x` from matching `jobs/x-2`.
pub fn process_signature(job_id: &str) -> String {
    format!("jobs/{job_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_paths_nest_under_workspace() {
        assert_eq!(job_dir("~/ptq_workspace/", "j1"), "~/ptq_workspace/jobs/j1");
        assert_eq!(
            worktree_dir("/w", "j1"),
            "/w/jobs/j1/pytorch"
        );
        assert_eq!(log_file("/w", "j1", 3), "/w/jobs/j1/claude-3.log");
    }

    #[test]
    fn signature_appears_in_worktree_path() {
        assert!(worktree_dir("/w", "20260217-120000-1").contains(&process_signature("20260217-120000-1")));
    }
}
