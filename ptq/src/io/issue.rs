//! GitHub issues as agent context, read through the `gh` CLI.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python)?\s*\n(.*?)```").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IssueData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IssueLabel {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IssueComment {
    #[serde(default)]
    pub author: Option<IssueAuthor>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IssueAuthor {
    #[serde(default)]
    pub login: String,
}

pub trait IssueSource {
    fn fetch(&self, number: u64) -> Result<IssueData>;
}

/// Reads issues with `gh issue view`.
#[derive(Debug, Clone)]
pub struct GhIssueSource {
    pub repo: String,
}

impl IssueSource for GhIssueSource {
    #[instrument(skip_all, fields(number, repo = %self.repo))]
    fn fetch(&self, number: u64) -> Result<IssueData> {
        let mut cmd = Command::new("gh");
        cmd.args([
            "issue",
            "view",
            &number.to_string(),
            "--repo",
            &self.repo,
            "--json",
            "title,body,comments,labels",
        ]);
        let stdout = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(120),
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )?
        .into_stdout(&format!("gh issue view {number}"))?;
        let issue: IssueData =
            serde_json::from_str(&stdout).context("parse gh issue json")?;
        debug!(title = %issue.title, comments = issue.comments.len(), "issue fetched");
        Ok(issue)
    }
}

/// First fenced code block (bare or `python`) in the body or comments that
/// imports torch.
pub fn extract_repro_script(issue: &IssueData) -> Option<String> {
    let mut text = issue.body.clone().unwrap_or_default();
    for comment in &issue.comments {
        text.push('\n');
        text.push_str(comment.body.as_deref().unwrap_or(""));
    }
    CODE_BLOCK_RE
        .captures_iter(&text)
        .map(|caps| caps[1].to_string())
        .find(|block| block.contains("import torch"))
        .map(|block| block.trim().to_string())
}

/// Markdown rendering of the issue for the agent's system prompt.
pub fn format_issue_context(issue: &IssueData, number: u64) -> String {
    let labels: Vec<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
    let labels = if labels.is_empty() {
        "none".to_string()
    } else {
        labels.join(", ")
    };
    let mut lines = vec![
        format!("# Issue #{number}: {}", issue.title),
        String::new(),
        format!("**Labels**: {labels}"),
        String::new(),
        "## Description".to_string(),
        String::new(),
        issue.body.clone().unwrap_or_default(),
    ];
    if !issue.comments.is_empty() {
        lines.extend(["".to_string(), "## Comments".to_string(), String::new()]);
        for (i, comment) in issue.comments.iter().enumerate() {
            let author = comment
                .author
                .as_ref()
                .map_or("unknown", |a| a.login.as_str());
            lines.push(format!("### Comment {} by @{author}", i + 1));
            lines.push(String::new());
            lines.push(comment.body.clone().unwrap_or_default());
            lines.push(String::new());
        }
    }
    lines.join("\n")
}
