//! Error types callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context. These variants are
//! recovered with `downcast_ref`, and [`Stage`] is attached as context so a
//! failure always names the step that broke.

use std::fmt;

use thiserror::Error;

use crate::core::lifecycle::JobState;

#[derive(Debug, Error)]
pub enum PtqError {
    #[error("unknown job: {0}")]
    JobNotFound(String),

    #[error("no jobs found for issue #{0}")]
    NoJobsForIssue(u64),

    #[error("job {job_id} is already running (pid {pid}); kill it or wait for it to stop")]
    AlreadyRunning { job_id: String, pid: u32 },

    #[error("another ptq process is launching job {0}")]
    LaunchInProgress(String),

    #[error("job directory for {job_id} not found at {path}")]
    JobDirMissing { job_id: String, path: String },

    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("checkout has uncommitted changes:\n{0}")]
    DirtyCheckout(String),

    #[error("diff does not apply cleanly:\n{0}")]
    DiffDoesNotApply(String),

    #[error("no diff available to apply for {0}")]
    NoDiff(String),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

/// Orchestration stage, attached as error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchIssue,
    Reserve,
    Provision,
    Launch,
    FetchResults,
    Release,
    Apply,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::FetchIssue => "fetch issue",
            Stage::Reserve => "reserve",
            Stage::Provision => "provision",
            Stage::Launch => "launch",
            Stage::FetchResults => "fetch results",
            Stage::Release => "release",
            Stage::Apply => "apply",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.as_str())
    }
}

/// The stage recorded on an error chain, if any.
pub fn stage_of(err: &anyhow::Error) -> Option<Stage> {
    err.downcast_ref::<Stage>().copied()
}
