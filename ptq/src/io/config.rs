//! ptq configuration stored under `~/.ptq/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Machine;

/// ptq configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. CLI flags override individual values per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtqConfig {
    /// Workspace root used for `--local` jobs.
    pub local_workspace: String,

    /// Workspace root used on remote machines.
    pub remote_workspace: String,

    /// GitHub repository issues are read from (`owner/name`).
    pub repo: String,

    /// Clone URL for the base checkout.
    pub source_url: String,

    pub python_version: String,

    /// Upper bound for any single shell command on a target.
    pub command_timeout_secs: u64,

    /// Poll interval while following an agent log.
    pub follow_poll_ms: u64,

    /// How long to wait for another process that holds the setup lock.
    pub setup_wait_secs: u64,

    /// Local directory of helper scripts copied to `<workspace>/scripts` at
    /// setup and before every run. Defaults to `<ptq home>/skills`.
    pub skills_dir: Option<String>,

    pub agent: AgentConfig,
    pub ssh: SshConfig,
    pub reservation: ReservationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub model: String,
    pub max_turns: u32,
    pub allowed_tools: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            model: "opus".to_string(),
            max_turns: 100,
            allowed_tools: "Read,Edit,Write,Bash,Grep,Glob".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    /// Extra arguments passed to both `ssh` and `scp`.
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            options: vec!["-o".to_string(), "StrictHostKeyChecking=no".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReservationConfig {
    pub program: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub max_hours: f64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            program: "gpu-dev".to_string(),
            gpu_type: "h100".to_string(),
            gpu_count: 1,
            max_hours: 4.0,
        }
    }
}

impl Default for PtqConfig {
    fn default() -> Self {
        Self {
            local_workspace: "~/.ptq_workspace".to_string(),
            remote_workspace: "~/ptq_workspace".to_string(),
            repo: "pytorch/pytorch".to_string(),
            source_url: "https://github.com/pytorch/pytorch.git".to_string(),
            python_version: "3.12".to_string(),
            command_timeout_secs: 2 * 60 * 60,
            follow_poll_ms: 1000,
            setup_wait_secs: 60 * 60,
            skills_dir: None,
            agent: AgentConfig::default(),
            ssh: SshConfig::default(),
            reservation: ReservationConfig::default(),
        }
    }
}

impl PtqConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.follow_poll_ms == 0 {
            return Err(anyhow!("follow_poll_ms must be > 0"));
        }
        if self.local_workspace.trim().is_empty() || self.remote_workspace.trim().is_empty() {
            return Err(anyhow!("workspace paths must be non-empty"));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.max_turns == 0 {
            return Err(anyhow!("agent.max_turns must be > 0"));
        }
        if self.reservation.program.trim().is_empty() {
            return Err(anyhow!("reservation.program must be non-empty"));
        }
        if self.reservation.gpu_count == 0 {
            return Err(anyhow!("reservation.gpu_count must be > 0"));
        }
        if self.reservation.max_hours.is_nan() || self.reservation.max_hours <= 0.0 {
            return Err(anyhow!("reservation.max_hours must be > 0"));
        }
        Ok(())
    }

    /// Default workspace root for a machine.
    pub fn workspace_for(&self, machine: &Machine) -> &str {
        if machine.is_local() {
            &self.local_workspace
        } else {
            &self.remote_workspace
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn follow_poll(&self) -> Duration {
        Duration::from_millis(self.follow_poll_ms)
    }

    pub fn setup_wait(&self) -> Duration {
        Duration::from_secs(self.setup_wait_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PtqConfig::default()`.
pub fn load_config(path: &Path) -> Result<PtqConfig> {
    if !path.exists() {
        let cfg = PtqConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PtqConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PtqConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PtqConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = PtqConfig::default();
        cfg.agent.model = "sonnet".to_string();
        cfg.reservation.gpu_type = "a100".to_string();
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "remote_workspace = \"/data/ptq\"\n[agent]\nmax_turns = 5\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.remote_workspace, "/data/ptq");
        assert_eq!(cfg.agent.max_turns, 5);
        assert_eq!(cfg.agent.program, "claude");
        assert_eq!(cfg.local_workspace, "~/.ptq_workspace");
    }

    #[test]
    fn rejects_zero_gpus() {
        let mut cfg = PtqConfig::default();
        cfg.reservation.gpu_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn workspace_depends_on_machine() {
        let cfg = PtqConfig::default();
        assert_eq!(cfg.workspace_for(&Machine::Local), "~/.ptq_workspace");
        assert_eq!(
            cfg.workspace_for(&Machine::Remote("gpu-box".to_string())),
            "~/ptq_workspace"
        );
    }
}
