//! Fetching a job's artifacts from its target into `~/.ptq/results/<job_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::layout;
use crate::core::lifecycle::ArtifactPresence;
use crate::core::types::JobRecord;
use crate::error::PtqError;
use crate::io::backend::{Backend, sh_path};

/// What a fetch brought back. Artifacts the agent never wrote are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub dir: PathBuf,
    pub report: Option<String>,
    pub diff: Option<String>,
    pub worklog: Option<String>,
    pub logs: Vec<PathBuf>,
}

impl Artifacts {
    pub fn diff_path(&self) -> PathBuf {
        self.dir.join(layout::DIFF_FILE)
    }

    /// True when the diff exists and has content.
    pub fn has_diff(&self) -> bool {
        self.diff.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}

/// Copy every artifact the job produced into `dest`.
///
/// Fails with [`PtqError::JobDirMissing`] when the job directory is gone from
/// the target; a transport error is returned as-is so the fetch can simply be
/// retried.
#[instrument(skip_all, fields(job_id = %job.job_id))]
pub fn fetch(backend: &dyn Backend, job: &JobRecord, dest: &Path) -> Result<Artifacts> {
    let job_dir = layout::job_dir(&job.workspace, &job.job_id);
    if !backend.test_path("-d", &job_dir)? {
        return Err(PtqError::JobDirMissing {
            job_id: job.job_id.clone(),
            path: job_dir,
        }
        .into());
    }
    fs::create_dir_all(dest).with_context(|| format!("create directory {}", dest.display()))?;

    let report = fetch_optional(backend, &job_dir, layout::REPORT_FILE, dest)?;
    let diff = fetch_optional(backend, &job_dir, layout::DIFF_FILE, dest)?;
    let worklog = fetch_optional(backend, &job_dir, layout::WORKLOG_FILE, dest)?;
    let mut logs = Vec::new();
    for run in 1..=job.run_count {
        let name = layout::log_file_name(run);
        if fetch_optional(backend, &job_dir, &name, dest)?.is_some() {
            logs.push(dest.join(name));
        }
    }
    debug!(
        report = report.is_some(),
        diff = diff.is_some(),
        logs = logs.len(),
        "artifacts fetched"
    );
    Ok(Artifacts {
        dir: dest.to_path_buf(),
        report,
        diff,
        worklog,
        logs,
    })
}

fn fetch_optional(
    backend: &dyn Backend,
    job_dir: &str,
    name: &str,
    dest: &Path,
) -> Result<Option<String>> {
    let remote = layout::join(job_dir, name);
    let local = dest.join(name);
    if !backend.test_path("-f", &remote)? {
        // Drop a stale copy from an earlier fetch.
        if local.exists() {
            fs::remove_file(&local).with_context(|| format!("remove {}", local.display()))?;
        }
        return Ok(None);
    }
    backend
        .copy_from(&remote, &local)
        .with_context(|| format!("fetch {name}"))?;
    let contents =
        fs::read_to_string(&local).with_context(|| format!("read {}", local.display()))?;
    Ok(Some(contents))
}

/// Which outcome artifacts are non-empty on the target.
pub fn presence(backend: &dyn Backend, job: &JobRecord) -> Result<ArtifactPresence> {
    let job_dir = layout::job_dir(&job.workspace, &job.job_id);
    let script = format!(
        "r=0; d=0; test -s {} && r=1; test -s {} && d=1; echo $r $d",
        sh_path(&layout::join(&job_dir, layout::REPORT_FILE)),
        sh_path(&layout::join(&job_dir, layout::DIFF_FILE)),
    );
    let out = backend.run_checked(&script, "check artifacts")?;
    let mut flags = out.split_whitespace().map(|f| f == "1");
    Ok(ArtifactPresence {
        report: flags.next().unwrap_or(false),
        diff: flags.next().unwrap_or(false),
    })
}
