//! Shared types for jobs, tasks, and targets.
//!
//! These are the persisted contracts of the local job index; field names are
//! stable JSON.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::lifecycle::JobState;

/// Machine name that means "run on this host".
pub const LOCAL_MACHINE: &str = "local";

/// Where a job executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Machine {
    Local,
    Remote(String),
}

impl Machine {
    pub fn is_local(&self) -> bool {
        matches!(self, Machine::Local)
    }
}

impl From<String> for Machine {
    fn from(value: String) -> Self {
        if value == LOCAL_MACHINE {
            Machine::Local
        } else {
            Machine::Remote(value)
        }
    }
}

impl From<Machine> for String {
    fn from(value: Machine) -> Self {
        match value {
            Machine::Local => LOCAL_MACHINE.to_string(),
            Machine::Remote(host) => host,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::Local => f.write_str(LOCAL_MACHINE),
            Machine::Remote(host) => f.write_str(host),
        }
    }
}

/// A machine plus the workspace root on it.
///
/// Workspace paths are target-side strings and may start with `~/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub machine: Machine,
    pub workspace: String,
}

/// How the user described the work, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSpec {
    Issue(u64),
    Freeform(String),
    FromFile(PathBuf),
}

/// Normalized task description stored on a job.
///
/// Identity is keyed on `issue_number` when present, otherwise on the
/// freeform description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub issue_number: Option<u64>,
    pub description: Option<String>,
}

impl Task {
    pub fn issue(number: u64) -> Self {
        Self {
            issue_number: Some(number),
            description: None,
        }
    }

    pub fn freeform(text: impl Into<String>) -> Self {
        Self {
            issue_number: None,
            description: Some(text.into()),
        }
    }

    /// Stable key used in job ids and for finding a job to re-run.
    pub fn identity_key(&self) -> String {
        match (self.issue_number, &self.description) {
            (Some(number), _) => number.to_string(),
            (None, Some(text)) => format!("adhoc-{}", short_hash(text)),
            (None, None) => "adhoc-empty".to_string(),
        }
    }

    /// Human label for listings: `#123` or the (shortened) task text.
    pub fn label(&self, max_chars: usize) -> String {
        if let Some(number) = self.issue_number {
            return format!("#{number}");
        }
        let text = self.description.as_deref().unwrap_or("").trim();
        let first_line = text.lines().next().unwrap_or("");
        if first_line.chars().count() <= max_chars && !text.contains('\n') {
            return first_line.to_string();
        }
        let cut: String = first_line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn short_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..6].to_string()
}

/// Reference to a launched agent process on the target.
///
/// `signature` is a substring that must appear in the process command line;
/// it guards against a recycled pid being mistaken for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub signature: String,
}

/// Persisted job record (`<ptq home>/jobs/<job_id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub task: Task,
    pub machine: Machine,
    pub workspace: String,
    /// Agent invocations attempted so far (0 until the first launch).
    pub run_count: u32,
    /// Present iff the controller believes a run is active.
    pub process_handle: Option<ProcessHandle>,
    pub reservation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last state the controller persisted. Liveness is re-derived on read.
    pub state: JobState,
}

impl JobRecord {
    pub fn target(&self) -> Target {
        Target {
            machine: self.machine.clone(),
            workspace: self.workspace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_serializes_with_local_sentinel() {
        let local = serde_json::to_string(&Machine::Local).expect("serialize");
        assert_eq!(local, "\"local\"");
        let remote: Machine = serde_json::from_str("\"gpu-box\"").expect("parse");
        assert_eq!(remote, Machine::Remote("gpu-box".to_string()));
    }

    #[test]
    fn identity_key_prefers_issue_number() {
        let task = Task {
            issue_number: Some(42),
            description: Some("also some text".to_string()),
        };
        assert_eq!(task.identity_key(), "42");
    }

    #[test]
    fn freeform_identity_is_deterministic_and_distinct() {
        let a = Task::freeform("hello").identity_key();
        let b = Task::freeform("hello").identity_key();
        let c = Task::freeform("world").identity_key();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("adhoc-"));
        assert_eq!(a.len(), "adhoc-".len() + 6);
    }

    #[test]
    fn label_shows_issue_or_task_text() {
        assert_eq!(Task::issue(7).label(20), "#7");
        assert_eq!(Task::freeform("fix oom").label(20), "fix oom");
        assert_eq!(
            Task::freeform("a very long task description").label(10),
            "a very ..."
        );
    }
}
