//! Job lifecycle state machine.
//!
//! ```text
//! CREATED -> PROVISIONING -> RUNNING -> {COMPLETED, FAILED, KILLED}
//!                 ^                              |
//!                 +------------- re-run ---------+
//! any non-running state -> CLEANED (terminal)
//! ```
//!
//! COMPLETED/FAILED/KILLED end a *run*, not the job: a later launch moves the
//! job back through PROVISIONING into RUNNING with its worktree intact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PtqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Provisioning,
    Running,
    Completed,
    Failed,
    Killed,
    Cleaned,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Provisioning => "provisioning",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Killed => "killed",
            JobState::Cleaned => "cleaned",
        }
    }

    /// States from which a fresh launch may begin.
    pub fn accepts_launch(self) -> bool {
        matches!(
            self,
            JobState::Created | JobState::Completed | JobState::Failed | JobState::Killed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Workspace materialization and worktree acquisition started.
    BeginProvisioning,
    /// Provisioning (workspace, worktree, or prompt upload) failed.
    ProvisioningFailed,
    /// The agent process was started.
    Launched,
    /// The agent process could not be started at all.
    LaunchFailed,
    /// The agent process was observed dead.
    Exited(ArtifactPresence),
    /// An explicit kill terminated the agent.
    Killed,
    /// Worktree released and record removed.
    Cleaned,
}

/// Which result artifacts were non-empty when a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArtifactPresence {
    pub report: bool,
    pub diff: bool,
}

/// Best-effort classification of a finished run.
///
/// The agent is opaque; a non-empty report or diff is the only signal that it
/// got somewhere.
pub fn classify_exit(presence: ArtifactPresence) -> JobState {
    if presence.report || presence.diff {
        JobState::Completed
    } else {
        JobState::Failed
    }
}

/// Apply `event` to `from`, rejecting transitions the lifecycle forbids.
pub fn transition(from: JobState, event: Event) -> Result<JobState, PtqError> {
    let to = match (from, event) {
        (state, Event::BeginProvisioning) if state.accepts_launch() => JobState::Provisioning,
        (JobState::Provisioning, Event::ProvisioningFailed | Event::LaunchFailed) => {
            JobState::Failed
        }
        (JobState::Provisioning, Event::Launched) => JobState::Running,
        (JobState::Running, Event::Exited(presence)) => classify_exit(presence),
        (JobState::Running, Event::Killed) => JobState::Killed,
        (state, Event::Cleaned) if state != JobState::Running && state != JobState::Cleaned => {
            JobState::Cleaned
        }
        (from, event) => {
            return Err(PtqError::InvalidTransition {
                from,
                to: target_of(event),
            });
        }
    };
    Ok(to)
}

fn target_of(event: Event) -> JobState {
    match event {
        Event::BeginProvisioning => JobState::Provisioning,
        Event::ProvisioningFailed | Event::LaunchFailed => JobState::Failed,
        Event::Launched => JobState::Running,
        Event::Exited(presence) => classify_exit(presence),
        Event::Killed => JobState::Killed,
        Event::Cleaned => JobState::Cleaned,
    }
}

/// True when a stored RUNNING state must be settled because its process died.
pub fn needs_settle(stored: JobState, live: bool) -> bool {
    stored == JobState::Running && !live
}

/// Status word shown by `list`/`status`/`peek`.
pub fn liveness_label(live: bool) -> &'static str {
    if live { "running" } else { "stopped" }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: ArtifactPresence = ArtifactPresence {
        report: true,
        diff: false,
    };

    #[test]
    fn happy_path_reaches_completed() {
        let s = transition(JobState::Created, Event::BeginProvisioning).expect("provision");
        let s = transition(s, Event::Launched).expect("launch");
        let s = transition(s, Event::Exited(REPORT)).expect("exit");
        assert_eq!(s, JobState::Completed);
    }

    #[test]
    fn exit_without_artifacts_is_failed() {
        let s = transition(JobState::Running, Event::Exited(ArtifactPresence::default()))
            .expect("exit");
        assert_eq!(s, JobState::Failed);
    }

    #[test]
    fn finished_runs_can_be_relaunched() {
        for state in [JobState::Completed, JobState::Failed, JobState::Killed] {
            assert_eq!(
                transition(state, Event::BeginProvisioning).expect("rerun"),
                JobState::Provisioning
            );
        }
    }

    #[test]
    fn running_job_rejects_second_launch() {
        let err = transition(JobState::Running, Event::BeginProvisioning).unwrap_err();
        assert!(matches!(
            err,
            PtqError::InvalidTransition {
                from: JobState::Running,
                to: JobState::Provisioning
            }
        ));
    }

    #[test]
    fn provisioning_failure_marks_failed() {
        assert_eq!(
            transition(JobState::Provisioning, Event::ProvisioningFailed).expect("fail"),
            JobState::Failed
        );
    }

    #[test]
    fn kill_only_applies_to_running() {
        assert_eq!(
            transition(JobState::Running, Event::Killed).expect("kill"),
            JobState::Killed
        );
        assert!(transition(JobState::Completed, Event::Killed).is_err());
    }

    #[test]
    fn cleaned_is_terminal() {
        let s = transition(JobState::Failed, Event::Cleaned).expect("clean");
        assert_eq!(s, JobState::Cleaned);
        assert!(transition(s, Event::BeginProvisioning).is_err());
        assert!(transition(s, Event::Cleaned).is_err());
    }

    #[test]
    fn running_job_cannot_be_cleaned_without_kill() {
        assert!(transition(JobState::Running, Event::Cleaned).is_err());
    }

    #[test]
    fn settle_only_dead_running_jobs() {
        assert!(needs_settle(JobState::Running, false));
        assert!(!needs_settle(JobState::Running, true));
        assert!(!needs_settle(JobState::Completed, false));
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Provisioning).expect("serialize");
        assert_eq!(json, "\"provisioning\"");
    }
}
