//! Stable exit codes for ptq CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (stage failure, invalid input, or any unrecovered error).
pub const FAILED: i32 = 1;
/// A launch was rejected because the job already has a live agent.
pub const ALREADY_RUNNING: i32 = 3;
/// The named job, or its directory on the target, does not exist.
pub const NOT_FOUND: i32 = 4;

/// Map an error chain to the exit code `main` should use.
pub fn for_error(err: &anyhow::Error) -> i32 {
    use crate::error::PtqError;

    match err.downcast_ref::<PtqError>() {
        Some(PtqError::AlreadyRunning { .. } | PtqError::LaunchInProgress(_)) => ALREADY_RUNNING,
        Some(
            PtqError::JobNotFound(_) | PtqError::NoJobsForIssue(_) | PtqError::JobDirMissing { .. },
        ) => NOT_FOUND,
        _ => FAILED,
    }
}
