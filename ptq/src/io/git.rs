//! Git adapter for the local checkout `apply` writes into.
//!
//! Target-side git (base checkout, worktrees) runs through a backend script;
//! this wrapper only drives a checkout on this machine.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::PtqError;

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Current branch name, or `None` on a detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            debug!("detached HEAD");
            return Ok(None);
        }
        Ok(Some(name))
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// `XY path` lines from porcelain status, untracked files included.
    pub fn changes(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Fail with [`PtqError::DirtyCheckout`] listing every changed path.
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let changes = self.changes()?;
        if changes.is_empty() {
            return Ok(());
        }
        warn!(changed = changes.len(), "checkout not clean");
        let listing = changes
            .iter()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(PtqError::DirtyCheckout(listing).into())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch or commit.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, rev: &str) -> Result<()> {
        debug!(rev, "checking out");
        self.run_checked(&["checkout", rev])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Dry-run a patch; `Err` carries git's explanation.
    pub fn apply_check(&self, patch: &Path) -> Result<std::result::Result<(), String>> {
        let patch = path_arg(patch)?;
        let out = self.run(&["apply", "--check", patch])?;
        if out.status.success() {
            Ok(Ok(()))
        } else {
            Ok(Err(String::from_utf8_lossy(&out.stderr).trim().to_string()))
        }
    }

    pub fn apply(&self, patch: &Path) -> Result<()> {
        self.run_checked(&["apply", path_arg(patch)?])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}
