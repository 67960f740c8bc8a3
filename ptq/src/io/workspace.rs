//! Per-machine workspace: venv with a PyTorch nightly and a base checkout
//! pinned to the commit that nightly was built from.
//!
//! Provisioning is a critical section across processes. The first caller
//! takes a `mkdir` lock, provisions, and writes the completion marker; a
//! concurrent caller waits for the lock and then observes the marker.

use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::cuda::{CPU_TAG, resolve_cuda_tag};
use crate::core::layout;
use crate::interrupt;
use crate::io::backend::{Backend, sh_path, shell_quote};
use crate::io::config::PtqConfig;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

const UV_INSTALL_URL: &str = "https://astral.sh/uv/install.sh";
const NIGHTLY_INDEX: &str = "https://download.pytorch.org/whl/nightly";

static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{40}\b").expect("valid regex"));

/// Which PyTorch wheel index to install from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WheelVariant {
    /// Read the driver's CUDA version from `nvidia-smi`.
    Detect,
    Cuda(String),
    Cpu,
}

#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub wheel: WheelVariant,
    pub python_version: String,
    pub source_url: String,
    pub repo: String,
    /// How long to wait for another process holding the setup lock.
    pub lock_wait: Duration,
    pub poll: Duration,
}

impl SetupOptions {
    pub fn from_config(cfg: &PtqConfig, wheel: WheelVariant) -> Self {
        Self {
            wheel,
            python_version: cfg.python_version.clone(),
            source_url: cfg.source_url.clone(),
            repo: cfg.repo.clone(),
            lock_wait: cfg.setup_wait(),
            poll: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyReady,
    Provisioned { revision: String, wheel_tag: String },
}

/// True when the marker exists and the layout it vouches for is intact.
pub fn is_ready(backend: &dyn Backend) -> Result<bool> {
    let ws = &backend.target().workspace;
    let script = format!(
        "test -f {} && test -e {} && test -x {}",
        sh_path(&layout::setup_marker(ws)),
        sh_path(&layout::join(&layout::base_checkout(ws), ".git")),
        sh_path(&layout::venv_python(ws)),
    );
    Ok(backend.run(&script)?.success())
}

/// Make sure the workspace is provisioned. Safe to call repeatedly and from
/// concurrent processes.
#[instrument(skip_all, fields(machine = %backend.target().machine, workspace = %backend.target().workspace))]
pub fn ensure(backend: &dyn Backend, opts: &SetupOptions) -> Result<EnsureOutcome> {
    if is_ready(backend)? {
        debug!("workspace already set up");
        return Ok(EnsureOutcome::AlreadyReady);
    }
    let Some(_lock) = SetupLock::acquire(backend, opts)? else {
        return Ok(EnsureOutcome::AlreadyReady);
    };
    // Another process may have finished between the check and the lock.
    if is_ready(backend)? {
        return Ok(EnsureOutcome::AlreadyReady);
    }
    provision(backend, opts)
}

/// The `mkdir` lock directory; removed on drop.
struct SetupLock<'a> {
    backend: &'a dyn Backend,
    path: String,
}

impl<'a> SetupLock<'a> {
    /// `Ok(None)` when the lock holder finished provisioning while we waited.
    fn acquire(backend: &'a dyn Backend, opts: &SetupOptions) -> Result<Option<Self>> {
        let ws = &backend.target().workspace;
        let path = layout::setup_lock(ws);
        let script = format!(
            "mkdir -p {} && mkdir {} 2>/dev/null",
            sh_path(ws),
            sh_path(&path)
        );
        let deadline = Instant::now() + opts.lock_wait;
        loop {
            if backend.run(&script)?.success() {
                debug!(lock = %path, "setup lock acquired");
                return Ok(Some(Self { backend, path }));
            }
            if is_ready(backend)? {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "timed out waiting for setup lock {path}; remove it if no setup is running"
                ));
            }
            interrupt::check()?;
            info!(lock = %path, "waiting for concurrent setup");
            thread::sleep(opts.poll);
        }
    }
}

impl Drop for SetupLock<'_> {
    fn drop(&mut self) {
        let script = format!("rm -rf {}", sh_path(&self.path));
        match self.backend.run(&script) {
            Ok(out) if out.success() => debug!(lock = %self.path, "setup lock released"),
            Ok(out) => warn!(lock = %self.path, stderr = %out.stderr_lossy(), "failed to remove setup lock"),
            Err(err) => warn!(lock = %self.path, err = %format!("{err:#}"), "failed to remove setup lock"),
        }
    }
}

fn provision(backend: &dyn Backend, opts: &SetupOptions) -> Result<EnsureOutcome> {
    let ws = backend.target().workspace.clone();
    let venv_python = sh_path(&layout::venv_python(&ws));

    let wheel_tag = resolve_wheel_tag(backend, &opts.wheel)?;
    info!(wheel_tag, "provisioning workspace");

    backend.run_checked(
        &format!(
            "command -v uv >/dev/null 2>&1 || curl -LsSf {UV_INSTALL_URL} | sh"
        ),
        "install uv",
    )?;
    backend.run_checked(
        &format!("mkdir -p {}", sh_path(&layout::jobs_dir(&ws))),
        "create workspace",
    )?;

    interrupt::check()?;
    backend.run_checked(
        &format!(
            "test -x {venv_python} || uv venv {} --python {}",
            sh_path(&layout::venv_dir(&ws)),
            shell_quote(&opts.python_version)
        ),
        "create venv",
    )?;
    info!("installing torch nightly");
    backend.run_checked(
        &format!(
            "uv pip install --python {venv_python} --pre torch --index-url {NIGHTLY_INDEX}/{wheel_tag}"
        ),
        "install torch nightly",
    )?;

    let nightly = backend
        .run_checked(
            &format!("{venv_python} -c 'import torch; print(torch.version.git_version)'"),
            "read torch git version",
        )?
        .trim()
        .to_string();
    let revision = resolve_main_hash(&opts.repo, &nightly);
    info!(nightly, revision, "pinning base checkout");

    interrupt::check()?;
    checkout_base(backend, opts, &revision)?;

    let smoke = backend.run_checked(
        &format!("{venv_python} -c 'import torch; print(torch.__version__, torch.cuda.is_available())'"),
        "smoke test",
    )?;
    debug!(smoke = %smoke.trim(), "smoke test passed");

    backend.run_checked(
        &format!(
            "printf '%s\\n' {} > {}",
            shell_quote(&revision),
            sh_path(&layout::setup_marker(&ws))
        ),
        "write setup marker",
    )?;
    Ok(EnsureOutcome::Provisioned {
        revision,
        wheel_tag,
    })
}

/// Clone into a scratch directory and move it into place, so a half-finished
/// clone is never mistaken for the base checkout. An existing checkout is
/// re-pinned in place because job worktrees hang off it.
fn checkout_base(backend: &dyn Backend, opts: &SetupOptions, revision: &str) -> Result<()> {
    let ws = &backend.target().workspace;
    let base = sh_path(&layout::base_checkout(ws));
    let partial = sh_path(&layout::join(ws, ".pytorch.partial"));
    let rev = shell_quote(revision);
    let script = format!(
        "if test -e {base}/.git; then \
           git -C {base} fetch --depth 1 origin {rev} && git -C {base} checkout -q --detach {rev}; \
         else \
           rm -rf {partial} && \
           git clone -q --depth 1 {url} {partial} && \
           git -C {partial} fetch -q --depth 1 origin {rev} && \
           git -C {partial} checkout -q --detach {rev} && \
           rm -rf {base} && mv {partial} {base}; \
         fi",
        url = shell_quote(&opts.source_url),
    );
    backend.run_checked(&script, "checkout base source")?;
    Ok(())
}

fn resolve_wheel_tag(backend: &dyn Backend, variant: &WheelVariant) -> Result<String> {
    match variant {
        WheelVariant::Cpu => Ok(CPU_TAG.to_string()),
        WheelVariant::Cuda(tag) => Ok(tag.clone()),
        WheelVariant::Detect => {
            let out = backend.run("nvidia-smi")?;
            if !out.success() {
                return Err(anyhow!(
                    "nvidia-smi not found on target machine. Use --cuda or --cpu to specify."
                ));
            }
            Ok(resolve_cuda_tag(&out.stdout_lossy())?.to_string())
        }
    }
}

/// Nightly builds record the commit of the nightly branch; its message names
/// the `main` commit it was cut from. Falls back to the nightly commit.
fn resolve_main_hash(repo: &str, nightly: &str) -> String {
    let mut cmd = Command::new("gh");
    cmd.args([
        "api",
        &format!("repos/{repo}/commits/{nightly}"),
        "--jq",
        ".commit.message",
    ]);
    let message = run_command_with_timeout(
        cmd,
        None,
        Duration::from_secs(60),
        DEFAULT_OUTPUT_LIMIT_BYTES,
    )
    .and_then(|out| out.into_stdout("gh api"))
    .context("look up nightly commit");
    match message {
        Ok(message) => commit_from_message(&message).unwrap_or_else(|| nightly.to_string()),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "using nightly commit as base revision");
            nightly.to_string()
        }
    }
}

fn commit_from_message(message: &str) -> Option<String> {
    COMMIT_RE.find(message).map(|m| m.as_str().to_string())
}
