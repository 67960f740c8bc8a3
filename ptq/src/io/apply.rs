//! Applying a job's diff to a local PyTorch checkout on a fresh branch.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::Task;
use crate::error::PtqError;
use crate::io::git::Git;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub branch: String,
    pub created_branch: bool,
}

/// `ptq/<issue>` for issue jobs, `ptq/<job_id>` otherwise.
pub fn branch_name(task: &Task, job_id: &str) -> String {
    match task.issue_number {
        Some(number) => format!("ptq/{number}"),
        None => format!("ptq/{job_id}"),
    }
}

/// Apply `diff` to the checkout at `checkout` on `branch`.
///
/// Refuses to touch a checkout with uncommitted changes. The diff is
/// dry-run first; if it does not apply, the previous branch is restored (and
/// a branch created here is deleted) before returning
/// [`PtqError::DiffDoesNotApply`].
#[instrument(skip_all, fields(checkout = %checkout.display(), branch))]
pub fn apply_diff(checkout: &Path, diff: &Path, branch: &str) -> Result<ApplyOutcome> {
    if !checkout.join(".git").exists() {
        return Err(anyhow!("not a git checkout: {}", checkout.display()));
    }
    let git = Git::new(checkout);
    git.ensure_clean()?;

    let previous = match git.current_branch()? {
        Some(name) => name,
        None => git.head_sha()?,
    };
    let created_branch = if git.branch_exists(branch)? {
        if previous != branch {
            git.checkout(branch)?;
        }
        false
    } else {
        git.checkout_new_branch(branch)?;
        true
    };

    if let Err(reason) = git.apply_check(diff)? {
        warn!(reason, "diff does not apply, restoring checkout");
        if previous != branch {
            git.checkout(&previous)?;
        }
        if created_branch {
            git.delete_branch(branch)?;
        }
        return Err(PtqError::DiffDoesNotApply(reason).into());
    }
    git.apply(diff)?;
    info!(branch, "diff applied");
    Ok(ApplyOutcome {
        branch: branch.to_string(),
        created_branch,
    })
}

/// Commands to commit the applied change and open a PR.
pub fn copy_paste_commands(checkout: &Path, branch: &str, task: &Task, job_id: &str) -> String {
    let cd = format!("cd {}", checkout.display());
    let push = format!("git push -u origin {branch}");
    match task.issue_number {
        Some(n) => format!(
            "{cd} && git add -p && git commit -m 'Fix #{n}' && {push} && gh pr create --title 'Fix #{n}' --body 'Fixes #{n}'"
        ),
        None => format!(
            "{cd} && git add -p && git commit -m 'Fix from {job_id}' && {push} && gh pr create --title 'Fix from {job_id}'"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("spawn git");
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn checkout() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "ptq@example.com"]);
        git(dir, &["config", "user.name", "ptq"]);
        fs::write(dir.join("ops.py"), "def add(a, b):\n    return a + b\n").expect("write");
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "base"]);
        temp
    }

    const GOOD_DIFF: &str = "\
diff --git a/ops.py b/ops.py
--- a/ops.py
+++ b/ops.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a + b
+    return b + a
";

    const BAD_DIFF: &str = "\
diff --git a/ops.py b/ops.py
--- a/ops.py
+++ b/ops.py
@@ -1,2 +1,2 @@
 def sub(a, b):
-    return a - b
+    return b - a
";

    #[test]
    fn branch_names_follow_task_shape() {
        assert_eq!(branch_name(&Task::issue(12345), "j"), "ptq/12345");
        assert_eq!(branch_name(&Task::freeform("x"), "j-1"), "ptq/j-1");
    }

    #[test]
    fn applies_on_new_branch() {
        let repo = checkout();
        let diff = repo.path().join(".git/ptq-fix.diff");
        fs::write(&diff, GOOD_DIFF).expect("write");
        let outcome = apply_diff(repo.path(), &diff, "ptq/12345").expect("apply");
        assert!(outcome.created_branch);
        assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "ptq/12345");
        let ops = fs::read_to_string(repo.path().join("ops.py")).expect("read");
        assert!(ops.contains("return b + a"));
    }

    #[test]
    fn failed_check_restores_previous_branch() {
        let repo = checkout();
        let diff = repo.path().join(".git/ptq-fix.diff");
        fs::write(&diff, BAD_DIFF).expect("write");
        let err = apply_diff(repo.path(), &diff, "ptq/7").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PtqError>(),
            Some(PtqError::DiffDoesNotApply(_))
        ));
        assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
        assert!(git(repo.path(), &["branch", "--list", "ptq/7"]).is_empty());
    }

    #[test]
    fn dirty_checkout_is_refused() {
        let repo = checkout();
        fs::write(repo.path().join("ops.py"), "local edit\n").expect("write");
        let diff = repo.path().join(".git/ptq-fix.diff");
        fs::write(&diff, GOOD_DIFF).expect("write");
        let err = apply_diff(repo.path(), &diff, "ptq/1").unwrap_err();
        match err.downcast_ref::<PtqError>() {
            Some(PtqError::DirtyCheckout(listing)) => assert!(listing.contains("ops.py")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    }

    #[test]
    fn commands_reference_issue() {
        let cmds = copy_paste_commands(Path::new("/src/pytorch"), "ptq/9", &Task::issue(9), "j");
        assert!(cmds.starts_with("cd /src/pytorch && git add -p"));
        assert!(cmds.contains("git push -u origin ptq/9 && gh pr create"));
        assert!(cmds.contains("Fixes #9"));
    }
}
