//! Per-job git worktrees of the shared base checkout.
//!
//! Each job owns `<workspace>/jobs/<job_id>/pytorch` on branch
//! `ptq-job/<job_id>`. Worktrees share the object store with the base
//! checkout but have their own index and working files, so one job's edits
//! never show up in another's tree.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::layout;
use crate::io::backend::{Backend, sh_path, shell_quote};

/// Create the job's worktree, or return the existing one untouched.
///
/// A leftover directory without a usable checkout (an interrupted earlier
/// attempt) is cleared and recreated.
#[instrument(skip_all, fields(job_id))]
pub fn acquire(backend: &dyn Backend, job_id: &str) -> Result<String> {
    let ws = &backend.target().workspace;
    let worktree = layout::worktree_dir(ws, job_id);
    if backend.test_path("-e", &layout::join(&worktree, ".git"))? {
        debug!(worktree, "reusing worktree");
        return Ok(worktree);
    }

    let base = sh_path(&layout::base_checkout(ws));
    let wt = sh_path(&worktree);
    let branch = shell_quote(&layout::worktree_branch(job_id));
    let script = format!(
        "if test -e {wt}; then \
           git -C {base} worktree remove --force {wt} >/dev/null 2>&1; \
           rm -rf {wt}; \
         fi; \
         git -C {base} worktree prune && \
         mkdir -p {job_dir} && \
         git -C {base} worktree add -q -B {branch} {wt} HEAD",
        job_dir = sh_path(&layout::job_dir(ws, job_id)),
    );
    backend.run_checked(&script, "create worktree")?;
    debug!(worktree, "worktree created");
    Ok(worktree)
}

/// Remove the job's worktree and branch. A no-op when neither exists; the
/// base checkout's own files are never touched.
#[instrument(skip_all, fields(job_id))]
pub fn release(backend: &dyn Backend, job_id: &str) -> Result<()> {
    let ws = &backend.target().workspace;
    let base = sh_path(&layout::base_checkout(ws));
    let wt = sh_path(&layout::worktree_dir(ws, job_id));
    let branch = shell_quote(&layout::worktree_branch(job_id));
    let script = format!(
        "if test -e {base}/.git; then \
           git -C {base} worktree remove --force {wt} >/dev/null 2>&1; \
           git -C {base} worktree prune; \
           git -C {base} branch -D {branch} >/dev/null 2>&1; \
         fi; \
         rm -rf {wt}"
    );
    backend.run_checked(&script, "remove worktree")?;
    debug!("worktree released");
    Ok(())
}
