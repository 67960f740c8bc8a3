//! Local state root (`~/.ptq` unless `PTQ_HOME` is set).

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

/// Environment variable overriding the local state root.
pub const HOME_ENV: &str = "PTQ_HOME";

/// Layout of the local state directory.
#[derive(Debug, Clone)]
pub struct PtqHome {
    root: PathBuf,
}

impl PtqHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$PTQ_HOME`, else `~/.ptq`.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self::new(home.join(".ptq")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.json"))
    }

    pub fn lock_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.lock"))
    }

    pub fn results_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("results").join(job_id)
    }

    /// Default source of the helper scripts deployed to every workspace.
    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }
}

/// Expand a leading `~` against the local home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    if path == "~" || path.starts_with("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        let rest = path.trim_start_matches('~').trim_start_matches('/');
        return Ok(if rest.is_empty() { home } else { home.join(rest) });
    }
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_home() {
        let home = PtqHome::new("/tmp/ptq-home");
        assert_eq!(home.config_path(), PathBuf::from("/tmp/ptq-home/config.toml"));
        assert_eq!(home.record_path("j1"), PathBuf::from("/tmp/ptq-home/jobs/j1.json"));
        assert_eq!(home.lock_path("j1"), PathBuf::from("/tmp/ptq-home/jobs/j1.lock"));
        assert_eq!(home.results_dir("j1"), PathBuf::from("/tmp/ptq-home/results/j1"));
        assert_eq!(home.skills_dir(), PathBuf::from("/tmp/ptq-home/skills"));
    }

    #[test]
    fn absolute_paths_are_not_expanded() {
        assert_eq!(expand_home("/srv/ws").expect("expand"), PathBuf::from("/srv/ws"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_home("~/ptq_workspace").expect("expand");
        assert!(expanded.ends_with("ptq_workspace"));
        assert!(!expanded.to_string_lossy().contains('~'));
    }
}
