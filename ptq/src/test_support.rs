//! Test-only helpers: a provisioned local workspace, a fake agent, and
//! in-memory issue and reservation sources.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::controller::Controller;
use crate::core::layout;
use crate::core::types::{Machine, Target};
use crate::io::config::PtqConfig;
use crate::io::issue::{IssueData, IssueSource};
use crate::io::paths::PtqHome;
use crate::io::reservation::{Reservation, ReservationManager, ReservationRequest};

/// File in the job directory where the hanging agent records its descendants.
pub const HANG_PIDS_FILE: &str = "agent-pids";

/// Number of descendants the hanging agent records.
pub const HANG_DESCENDANTS: usize = 4;

/// File every fake agent edits in its worktree.
pub const FIXED_FILE: &str = "torch/ops.py";
const BASE_CONTENTS: &str = "def add(a, b):\n    return a + b\n";

/// How the fake agent behaves when launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentBehavior {
    /// Streams a few events, edits the worktree, writes report, diff and worklog.
    Finish,
    /// Writes nothing and exits non-zero.
    Fail,
    /// Starts child processes and never exits on its own.
    Hang,
}

/// A ptq home plus a local workspace that already looks provisioned: a git
/// base checkout, an executable venv python and the setup marker.
pub struct TestEnv {
    temp: TempDir,
    pub home: PtqHome,
    pub config: PtqConfig,
}

impl TestEnv {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let home = PtqHome::new(temp.path().join("home"));
        let workspace = temp.path().join("workspace");
        let base = workspace.join(layout::BASE_CHECKOUT);
        fs::create_dir_all(base.join("torch")).context("create base checkout")?;
        fs::write(base.join(FIXED_FILE), BASE_CONTENTS).context("write base file")?;
        git(&base, &["init", "-q"])?;
        git(&base, &["add", "."])?;
        git(&base, &["commit", "-q", "-m", "base"])?;

        let venv_bin = workspace.join(".venv/bin");
        fs::create_dir_all(&venv_bin).context("create venv")?;
        write_executable(&venv_bin.join("python"), "#!/bin/sh\nexit 0\n")?;
        fs::create_dir_all(workspace.join("jobs")).context("create jobs dir")?;
        fs::write(workspace.join(layout::SETUP_MARKER), "base\n").context("write marker")?;

        let config = PtqConfig {
            local_workspace: workspace.to_string_lossy().into_owned(),
            follow_poll_ms: 50,
            command_timeout_secs: 60,
            setup_wait_secs: 5,
            ..PtqConfig::default()
        };
        let mut env = Self { temp, home, config };
        env.set_agent(AgentBehavior::Finish)?;
        Ok(env)
    }

    pub fn workspace(&self) -> PathBuf {
        PathBuf::from(&self.config.local_workspace)
    }

    pub fn local_target(&self) -> Target {
        Target {
            machine: Machine::Local,
            workspace: self.config.local_workspace.clone(),
        }
    }

    pub fn worktree(&self, job_id: &str) -> PathBuf {
        PathBuf::from(layout::worktree_dir(&self.config.local_workspace, job_id))
    }

    pub fn controller(&self) -> Controller {
        Controller::new(self.home.clone(), self.config.clone())
    }

    /// Install a fake agent program with the given behavior.
    pub fn set_agent(&mut self, behavior: AgentBehavior) -> Result<()> {
        let path = self.temp.path().join("bin").join(match behavior {
            AgentBehavior::Finish => "agent-finish",
            AgentBehavior::Fail => "agent-fail",
            AgentBehavior::Hang => "agent-hang",
        });
        fs::create_dir_all(path.parent().unwrap_or(self.temp.path())).context("create bin")?;
        write_executable(&path, &agent_script(behavior))?;
        self.config.agent.program = path.to_string_lossy().into_owned();
        Ok(())
    }

    /// A standalone clone of the base checkout, as a developer's local tree.
    pub fn local_checkout(&self) -> Result<PathBuf> {
        let dest = self.temp.path().join("local-pytorch");
        let base = self.workspace().join(layout::BASE_CHECKOUT);
        git(
            self.temp.path(),
            &["clone", "-q", &base.to_string_lossy(), &dest.to_string_lossy()],
        )?;
        Ok(dest)
    }
}

fn agent_script(behavior: AgentBehavior) -> String {
    match behavior {
        AgentBehavior::Finish => format!(
            r#"#!/bin/sh
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"Looking at the issue"}}]}}}}'
echo '{{"type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Bash","input":{{"command":"python repro.py"}}}}]}}}}'
printf '# fixed\n' >> {file}
git --no-pager diff > ../fix.diff
printf '# Report\n\nFixed add.\n' > ../report.md
printf -- '- reproduced\n- fixed\n' >> ../worklog.md
echo '{{"type":"result","subtype":"success"}}'
"#,
            file = FIXED_FILE
        ),
        AgentBehavior::Fail => "#!/bin/sh\necho 'agent crashed' >&2\nexit 3\n".to_string(),
        // Every descendant appends its pid to ../agent-pids (the job directory).
        AgentBehavior::Hang => r#"#!/bin/sh
pids="$PWD/../agent-pids"
sh -c 'echo $$ >> "$1"; sleep 300 & echo $! >> "$1"; wait' hang-child "$pids" &
if command -v setsid >/dev/null 2>&1; then
  setsid sh -c 'echo $$ >> "$1"; sleep 300 & echo $! >> "$1"; wait' hang-escaped "$pids" &
else
  sh -c 'echo $$ >> "$1"; sleep 300 & echo $! >> "$1"; wait' hang-escaped "$pids" &
fi
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]}}'
wait
"#
            .to_string(),
    }
}

fn write_executable(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

/// Run git with a fixed identity so commits work on bare CI machines.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(["-c", "user.name=ptq", "-c", "user.email=ptq@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !out.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Pids recorded in `path`, one per line; empty if the file is missing.
pub fn recorded_pids(path: &Path) -> Vec<u32> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// True if `pid` names a process that is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(out) = Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
    else {
        return false;
    };
    let stat = String::from_utf8_lossy(&out.stdout);
    let stat = stat.trim();
    !stat.is_empty() && !stat.starts_with('Z')
}

/// True if any process other than zombies has `needle` in its command line.
pub fn process_running(needle: &str) -> bool {
    let Ok(out) = Command::new("ps").args(["-eo", "stat=,args="]).output() else {
        return false;
    };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .any(|line| !line.trim_start().starts_with('Z') && line.contains(needle))
}

/// Issues served from memory; unknown numbers fail like a missing issue.
#[derive(Debug, Default)]
pub struct StaticIssues {
    issues: HashMap<u64, IssueData>,
    pub fetched: RefCell<Vec<u64>>,
}

impl StaticIssues {
    pub fn with(mut self, number: u64, issue: IssueData) -> Self {
        self.issues.insert(number, issue);
        self
    }
}

impl IssueSource for StaticIssues {
    fn fetch(&self, number: u64) -> Result<IssueData> {
        self.fetched.borrow_mut().push(number);
        self.issues
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("Could not resolve to an issue with the number of {number}"))
    }
}

/// Reservations that hand out a fixed host and record every call.
#[derive(Debug)]
pub struct RecordingReservations {
    pub host: String,
    pub fail_reserve: bool,
    pub fail_release: bool,
    pub reserved: RefCell<Vec<ReservationRequest>>,
    pub released: RefCell<Vec<String>>,
}

impl RecordingReservations {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            fail_reserve: false,
            fail_release: false,
            reserved: RefCell::new(Vec::new()),
            released: RefCell::new(Vec::new()),
        }
    }
}

impl ReservationManager for RecordingReservations {
    fn reserve(&self, request: &ReservationRequest) -> Result<Reservation> {
        self.reserved.borrow_mut().push(request.clone());
        if self.fail_reserve {
            bail!("no capacity for {}", request.gpu_type);
        }
        Ok(Reservation {
            id: format!("res-{}", self.reserved.borrow().len()),
            host: self.host.clone(),
        })
    }

    fn release(&self, reservation_id: &str) -> Result<()> {
        self.released.borrow_mut().push(reservation_id.to_string());
        if self.fail_release {
            bail!("cancel {reservation_id}: api unavailable");
        }
        Ok(())
    }
}

/// Issue with a fenced repro script and one comment.
pub fn sample_issue() -> IssueData {
    serde_json::from_value(serde_json::json!({
        "title": "add returns wrong result on CUDA",
        "body": "Repro:\n```python\nimport torch\nprint(torch.add(1, 2))\n```\n",
        "labels": [{"name": "module: cuda"}],
        "comments": [{"author": {"login": "someone"}, "body": "Also on 2.5"}],
    }))
    .unwrap_or_default()
}
