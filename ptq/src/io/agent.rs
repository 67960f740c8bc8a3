//! The coding agent as an opaque external process.
//!
//! ptq never looks inside the agent. It starts a shell command detached from
//! the launching session with output redirected to a run log, checks liveness
//! by pid plus a command-line signature (so a recycled pid is never mistaken
//! for the agent), tears down the whole process tree on kill, and tails the
//! log for follow mode.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ProcessHandle;
use crate::interrupt;
use crate::io::backend::{Backend, sh_path, shell_quote};
use crate::io::config::AgentConfig;

pub const ISSUE_MESSAGE: &str =
    "Investigate and fix the PyTorch issue described in your system prompt.";
pub const ADHOC_MESSAGE: &str = "Complete the task described in your system prompt.";

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct StartParams {
    /// Shell command line to run detached.
    pub command: String,
    /// Run log on the target; receives stdout and stderr.
    pub log_path: String,
    /// Substring of the command line identifying this job's process.
    pub signature: String,
}

/// How a followed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The process is gone and the log was read to the end.
    Exited,
    /// Ctrl-C; the process keeps running.
    Detached,
}

/// Start/observe/stop capability for an opaque external process.
pub trait ExternalTask {
    fn start(&self, params: &StartParams) -> Result<ProcessHandle>;

    fn is_live(&self, handle: &ProcessHandle) -> Result<bool>;

    /// Terminate the process and every descendant it spawned.
    fn terminate(&self, handle: &ProcessHandle) -> Result<()>;

    /// Feed complete log lines to `sink` from `log_path` until the process
    /// exits or the user interrupts.
    fn stream_output(
        &self,
        handle: &ProcessHandle,
        log_path: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<StreamEnd>;
}

/// [`ExternalTask`] backed by a detached `sh -c` on a [`Backend`].
pub struct DetachedShell<'a> {
    backend: &'a dyn Backend,
    poll: Duration,
    interrupted: fn() -> bool,
}

impl<'a> DetachedShell<'a> {
    pub fn new(backend: &'a dyn Backend, poll: Duration) -> Self {
        Self {
            backend,
            poll,
            interrupted: interrupt::requested,
        }
    }

    #[cfg(test)]
    fn with_interrupt(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }
}

impl ExternalTask for DetachedShell<'_> {
    #[instrument(skip_all, fields(signature = %params.signature))]
    fn start(&self, params: &StartParams) -> Result<ProcessHandle> {
        let log = sh_path(&params.log_path);
        let cmd = shell_quote(&params.command);
        // setsid makes the agent a process-group leader so kill reaches its children.
        let script = format!(
            "if command -v setsid >/dev/null 2>&1; then \
               setsid sh -c {cmd} > {log} 2>&1 < /dev/null & \
             else \
               nohup sh -c {cmd} > {log} 2>&1 < /dev/null & \
             fi; \
             echo $!"
        );
        let stdout = self.backend.run_checked(&script, "start agent")?;
        let pid: u32 = stdout
            .trim()
            .parse()
            .map_err(|_| anyhow!("start agent printed no pid: {:?}", stdout.trim()))?;
        info!(pid, "agent started");
        Ok(ProcessHandle {
            pid,
            signature: params.signature.clone(),
        })
    }

    fn is_live(&self, handle: &ProcessHandle) -> Result<bool> {
        let live = self.backend.run(&live_check(handle))?.success();
        debug!(pid = handle.pid, live, "liveness probe");
        Ok(live)
    }

    #[instrument(skip_all, fields(pid = handle.pid))]
    fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        if !self.is_live(handle)? {
            debug!("process already gone");
            return Ok(());
        }
        let pid = handle.pid;
        // Collect descendants before signalling: once a parent dies its
        // children are re-parented and can no longer be found by ppid.
        let script = format!(
            "pids={pid}; queue={pid}; \
             while [ -n \"$queue\" ]; do \
               next=''; \
               for p in $queue; do \
                 for c in $(ps -eo pid=,ppid= | awk -v p=\"$p\" '$2 == p {{ print $1 }}'); do \
                   pids=\"$pids $c\"; next=\"$next $c\"; \
                 done; \
               done; \
               queue=$next; \
             done; \
             kill -TERM -- -{pid} 2>/dev/null; kill -TERM $pids 2>/dev/null; \
             sleep 1; \
             kill -KILL -- -{pid} 2>/dev/null; kill -KILL $pids 2>/dev/null; \
             true"
        );
        self.backend.run_checked(&script, "kill agent")?;
        if self.is_live(handle)? {
            warn!("agent still alive after SIGKILL");
            return Err(anyhow!("process {pid} survived kill"));
        }
        info!("agent terminated");
        Ok(())
    }

    fn stream_output(
        &self,
        handle: &ProcessHandle,
        log_path: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<StreamEnd> {
        let log = sh_path(log_path);
        let mut offset: u64 = 0;
        let mut pending: Vec<u8> = Vec::new();
        loop {
            // Liveness is sampled before reading, so a "dead" poll has seen the whole log.
            let script = format!(
                "if {}; then echo live; else echo dead; fi; tail -c +{} {log} 2>/dev/null; true",
                live_check(handle),
                offset + 1
            );
            let out = self.backend.run(&script)?;
            if !out.success() {
                // Ctrl-C reaches the poll child too; its death is the interrupt, not a failure.
                if (self.interrupted)() {
                    debug!("poll interrupted, detaching");
                    return Ok(StreamEnd::Detached);
                }
                return Err(anyhow!("poll agent log failed: {}", out.stderr_lossy().trim()));
            }
            let (status, chunk) = split_status(&out.stdout);
            offset += chunk.len() as u64;
            pending.extend_from_slice(chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                sink(String::from_utf8_lossy(&line).trim_end_matches('\n'));
            }
            if status != "live" {
                if !pending.is_empty() {
                    sink(&String::from_utf8_lossy(&pending));
                }
                return Ok(StreamEnd::Exited);
            }
            if (self.interrupted)() {
                return Ok(StreamEnd::Detached);
            }
            thread::sleep(self.poll);
        }
    }
}

/// Script exiting 0 iff `handle` names a live (non-zombie) process whose
/// command line carries the signature.
fn live_check(handle: &ProcessHandle) -> String {
    format!(
        "ps -o stat= -o args= -p {} 2>/dev/null | grep -v '^ *Z' | grep -qF -- {}",
        handle.pid,
        shell_quote(&handle.signature)
    )
}

fn split_status(stdout: &[u8]) -> (&str, &[u8]) {
    match stdout.iter().position(|b| *b == b'\n') {
        Some(pos) => (
            std::str::from_utf8(&stdout[..pos]).unwrap_or("").trim(),
            &stdout[pos + 1..],
        ),
        None => (std::str::from_utf8(stdout).unwrap_or("").trim(), &[]),
    }
}

/// Inputs for the agent command line.
#[derive(Debug, Clone)]
pub struct AgentInvocation<'a> {
    pub agent: &'a AgentConfig,
    pub message: &'a str,
    pub worktree: &'a str,
    pub prompt_file: &'a str,
    /// Force line-buffered stdout (remote runs, where the log is tailed live).
    pub line_buffered: bool,
}

impl AgentInvocation<'_> {
    pub fn command_line(&self) -> String {
        let stdbuf = if self.line_buffered { "stdbuf -oL " } else { "" };
        format!(
            "cd {wt} && {stdbuf}{program} -p {message} --model {model} --max-turns {turns} \
             --allowedTools {tools} --dangerously-skip-permissions \
             --append-system-prompt-file {prompt} --output-format stream-json --verbose",
            wt = sh_path(self.worktree),
            program = self.agent.program,
            message = shell_quote(self.message),
            model = shell_quote(&self.agent.model),
            turns = self.agent.max_turns,
            tools = shell_quote(&self.agent.allowed_tools),
            prompt = sh_path(self.prompt_file),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::ExitStatus;

    use crate::core::types::{Machine, Target};
    use crate::io::process::CommandOutput;

    #[test]
    fn remote_command_is_line_buffered() {
        let agent = AgentConfig::default();
        let mut inv = AgentInvocation {
            agent: &agent,
            message: ISSUE_MESSAGE,
            worktree: "~/ptq_workspace/jobs/j1/pytorch",
            prompt_file: "~/ptq_workspace/jobs/j1/system_prompt.md",
            line_buffered: true,
        };
        let remote = inv.command_line();
        assert!(remote.starts_with("cd \"$HOME\"/'ptq_workspace/jobs/j1/pytorch' && stdbuf -oL claude -p "));
        assert!(remote.contains("--model 'opus' --max-turns 100"));
        assert!(remote.contains("--append-system-prompt-file \"$HOME\"/'ptq_workspace/jobs/j1/system_prompt.md'"));
        assert!(remote.ends_with("--output-format stream-json --verbose"));

        inv.line_buffered = false;
        assert!(!inv.command_line().contains("stdbuf"));
    }

    /// Answers every script with the exit status of a shell killed by SIGINT.
    struct InterruptedPoll {
        target: Target,
    }

    impl InterruptedPoll {
        fn new() -> Self {
            Self {
                target: Target {
                    machine: Machine::Local,
                    workspace: "/unused".to_string(),
                },
            }
        }
    }

    impl Backend for InterruptedPoll {
        fn target(&self) -> &Target {
            &self.target
        }

        fn run(&self, _script: &str) -> Result<CommandOutput> {
            Ok(CommandOutput {
                status: ExitStatus::from_raw(130 << 8),
                stdout: Vec::new(),
                stderr: Vec::new(),
                stdout_truncated: 0,
                stderr_truncated: 0,
                timed_out: false,
            })
        }

        fn copy_to(&self, _local: &Path, _dest: &str) -> Result<()> {
            Err(anyhow!("no copies"))
        }

        fn copy_from(&self, _src: &str, _local: &Path) -> Result<()> {
            Err(anyhow!("no copies"))
        }
    }

    fn handle() -> ProcessHandle {
        ProcessHandle {
            pid: 4242,
            signature: "jobs/j1/".to_string(),
        }
    }

    /// Verifies a poll killed by Ctrl-C detaches instead of failing.
    #[test]
    fn interrupted_poll_detaches() {
        let backend = InterruptedPoll::new();
        let shell = DetachedShell::new(&backend, Duration::from_millis(1)).with_interrupt(|| true);
        let end = shell
            .stream_output(&handle(), "/unused/log", &mut |_: &str| {})
            .expect("stream");
        assert_eq!(end, StreamEnd::Detached);
    }

    /// Verifies a failed poll without Ctrl-C is still an error.
    #[test]
    fn failed_poll_without_interrupt_is_an_error() {
        let backend = InterruptedPoll::new();
        let shell = DetachedShell::new(&backend, Duration::from_millis(1)).with_interrupt(|| false);
        let err = shell
            .stream_output(&handle(), "/unused/log", &mut |_: &str| {})
            .unwrap_err();
        assert!(err.to_string().starts_with("poll agent log failed"));
    }

    #[test]
    fn status_line_is_split_from_log_bytes() {
        assert_eq!(split_status(b"live\n{\"a\":1}\npar"), ("live", &b"{\"a\":1}\npar"[..]));
        assert_eq!(split_status(b"dead\n"), ("dead", &b""[..]));
    }
}
