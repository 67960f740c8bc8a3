//! Shell backends: where a job's commands actually run.
//!
//! Every target-side operation is a POSIX `sh` script run through a
//! [`Backend`], so the same code drives the local machine and an SSH host.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::{Machine, Target};
use crate::io::config::PtqConfig;
use crate::io::paths::expand_home;
use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Login profiles are not read by non-interactive ssh; tools installed by the
/// setup step (`uv`) live under `~/.local/bin`.
const REMOTE_ENV_PREFIX: &str = "source ~/.profile 2>/dev/null; \
     source ~/.bashrc 2>/dev/null; \
     export PATH=\"$HOME/.local/bin:$HOME/.cargo/bin:$PATH\" && ";

pub trait Backend {
    fn target(&self) -> &Target;

    /// Run a shell script on the target.
    fn run(&self, script: &str) -> Result<CommandOutput>;

    /// Copy a local file to `dest` on the target.
    fn copy_to(&self, local: &Path, dest: &str) -> Result<()>;

    /// Copy `src` on the target to a local file.
    fn copy_from(&self, src: &str, local: &Path) -> Result<()>;

    /// Run a script and return its stdout, failing on a non-zero exit.
    fn run_checked(&self, script: &str, label: &str) -> Result<String> {
        self.run(script)?.into_stdout(label)
    }

    /// `test <flag> <path>` on the target.
    fn test_path(&self, flag: &str, path: &str) -> Result<bool> {
        Ok(self.run(&format!("test {flag} {}", sh_path(path)))?.success())
    }

    /// Contents of a file on the target, `None` if it does not exist.
    fn read_file(&self, path: &str) -> Result<Option<String>> {
        let quoted = sh_path(path);
        let out = self.run(&format!("test -f {quoted} && cat {quoted}"))?;
        if out.success() {
            Ok(Some(out.stdout_lossy()))
        } else {
            Ok(None)
        }
    }
}

/// Backend for a target, built from config.
pub fn connect(target: &Target, cfg: &PtqConfig) -> Box<dyn Backend> {
    match &target.machine {
        Machine::Local => Box::new(LocalBackend::new(target.clone(), cfg.command_timeout())),
        Machine::Remote(host) => Box::new(RemoteBackend {
            target: target.clone(),
            host: host.clone(),
            ssh_options: cfg.ssh.options.clone(),
            timeout: cfg.command_timeout(),
        }),
    }
}

/// Runs scripts with the local `sh`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    target: Target,
    timeout: Duration,
}

impl LocalBackend {
    pub fn new(target: Target, timeout: Duration) -> Self {
        Self { target, timeout }
    }
}

impl Backend for LocalBackend {
    fn target(&self) -> &Target {
        &self.target
    }

    #[instrument(skip_all)]
    fn run(&self, script: &str) -> Result<CommandOutput> {
        debug!(script, "local run");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        run_command_with_timeout(cmd, None, self.timeout, DEFAULT_OUTPUT_LIMIT_BYTES)
    }

    fn copy_to(&self, local: &Path, dest: &str) -> Result<()> {
        let dest = expand_home(dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(local, &dest)
            .with_context(|| format!("copy {} to {}", local.display(), dest.display()))?;
        Ok(())
    }

    fn copy_from(&self, src: &str, local: &Path) -> Result<()> {
        let src = expand_home(src)?;
        fs::copy(&src, local)
            .with_context(|| format!("copy {} to {}", src.display(), local.display()))?;
        Ok(())
    }
}

/// Runs scripts over `ssh` and copies with `scp`.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    target: Target,
    host: String,
    ssh_options: Vec<String>,
    timeout: Duration,
}

impl RemoteBackend {
    fn scp(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(&self.ssh_options).arg(from).arg(to);
        run_command_with_timeout(cmd, None, self.timeout, DEFAULT_OUTPUT_LIMIT_BYTES)?
            .into_stdout(&format!("scp {from} {to}"))?;
        Ok(())
    }

    fn remote_spec(&self, path: &str) -> String {
        // scp resolves relative paths against the remote home.
        let path = path.strip_prefix("~/").unwrap_or(path);
        format!("{}:{}", self.host, path)
    }
}

impl Backend for RemoteBackend {
    fn target(&self) -> &Target {
        &self.target
    }

    #[instrument(skip_all, fields(host = %self.host))]
    fn run(&self, script: &str) -> Result<CommandOutput> {
        debug!(script, "ssh run");
        let mut cmd = Command::new("ssh");
        cmd.args(&self.ssh_options)
            .arg(&self.host)
            .arg(format!("{REMOTE_ENV_PREFIX}{script}"));
        run_command_with_timeout(cmd, None, self.timeout, DEFAULT_OUTPUT_LIMIT_BYTES)
    }

    fn copy_to(&self, local: &Path, dest: &str) -> Result<()> {
        let local = local
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 path {}", local.display()))?;
        self.scp(local, &self.remote_spec(dest))
    }

    fn copy_from(&self, src: &str, local: &Path) -> Result<()> {
        let local = local
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 path {}", local.display()))?;
        self.scp(&self.remote_spec(src), local)
    }
}

/// Single-quote `input` for `sh`.
pub fn shell_quote(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    let mut out = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote a target path for `sh`, keeping a leading `~` expandable.
pub fn sh_path(path: &str) -> String {
    if path == "~" {
        return "\"$HOME\"".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}
