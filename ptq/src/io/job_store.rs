//! Local job records: one JSON file per job under `~/.ptq/jobs/`.
//!
//! A record is claimed with an exclusive create, so two processes creating
//! jobs in the same second end up with distinct ids. Updates replace the file
//! atomically (temp file + rename). Launches of one job are serialized with an
//! advisory lock on `<job_id>.lock`.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, instrument, warn};

use crate::core::job_id::{base_job_id, candidate_ids, compare_ids};
use crate::core::lifecycle::JobState;
use crate::core::types::{JobRecord, Target, Task};
use crate::error::PtqError;
use crate::io::paths::PtqHome;

#[derive(Debug, Clone)]
pub struct JobStore {
    home: PtqHome,
}

impl JobStore {
    pub fn new(home: PtqHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &PtqHome {
        &self.home
    }

    /// Create a record in state CREATED under a freshly claimed id.
    #[instrument(skip_all, fields(identity = %task.identity_key(), machine = %target.machine))]
    pub fn create(
        &self,
        task: Task,
        target: &Target,
        created_at: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let dir = self.home.jobs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

        let base = base_job_id(created_at, &task);
        for job_id in candidate_ids(&base) {
            let path = self.home.record_path(&job_id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(job_id, "id taken, trying next");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
            }
            let record = JobRecord {
                job_id,
                task,
                machine: target.machine.clone(),
                workspace: target.workspace.clone(),
                run_count: 0,
                process_handle: None,
                reservation_id: None,
                created_at,
                state: JobState::Created,
            };
            self.update(&record)?;
            debug!(job_id = %record.job_id, "job created");
            return Ok(record);
        }
        Err(anyhow!("no free job id for {base}"))
    }

    /// Load a record by exact id.
    pub fn load(&self, job_id: &str) -> Result<JobRecord> {
        let path = self.home.record_path(job_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PtqError::JobNotFound(job_id.to_string()).into());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Resolve a job id, or a bare issue number to that issue's newest job.
    pub fn resolve(&self, id_or_issue: &str) -> Result<JobRecord> {
        if self.home.record_path(id_or_issue).exists() {
            return self.load(id_or_issue);
        }
        let Ok(issue) = id_or_issue.parse::<u64>() else {
            return Err(PtqError::JobNotFound(id_or_issue.to_string()).into());
        };
        self.list()?
            .into_iter()
            .filter(|r| r.task.issue_number == Some(issue))
            .max_by(creation_order)
            .ok_or_else(|| PtqError::NoJobsForIssue(issue).into())
    }

    /// Newest job with the same task identity on `target` (machine and workspace).
    pub fn find_existing(&self, task: &Task, target: &Target) -> Result<Option<JobRecord>> {
        let key = task.identity_key();
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| {
                r.machine == target.machine
                    && r.workspace == target.workspace
                    && r.task.identity_key() == key
            })
            .max_by(creation_order))
    }

    /// Atomically replace the stored record.
    pub fn update(&self, record: &JobRecord) -> Result<()> {
        debug!(job_id = %record.job_id, state = %record.state, "writing job record");
        let mut buf = serde_json::to_string_pretty(record).context("serialize job record")?;
        buf.push('\n');
        write_atomic(&self.home.record_path(&record.job_id), &buf)
    }

    /// Delete the record and its lock file. Missing files are fine.
    pub fn remove(&self, job_id: &str) -> Result<()> {
        for path in [self.home.record_path(job_id), self.home.lock_path(job_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
            }
        }
        Ok(())
    }

    /// All records, oldest first. Unreadable records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<JobRecord>> {
        let dir = self.home.jobs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry.context("read jobs entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable job record"),
            }
        }
        records.sort_by(creation_order);
        Ok(records)
    }

    /// Take the per-job launch lock without blocking.
    pub fn lock(&self, job_id: &str) -> Result<JobLock> {
        let path = self.home.lock_path(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(PtqError::LaunchInProgress(job_id.to_string()).into());
        }
        debug!(job_id, "job lock acquired");
        Ok(JobLock { file, path })
    }
}

/// Held for the duration of a launch; released on drop.
#[derive(Debug)]
pub struct JobLock {
    file: File,
    path: PathBuf,
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %e, "failed to release job lock");
        }
    }
}

fn creation_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| compare_ids(&a.job_id, &b.job_id))
}

fn read_record(path: &Path) -> Result<JobRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("job record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp job record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace job record {}", path.display()))?;
    Ok(())
}
