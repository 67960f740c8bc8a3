//! System prompt rendering for agent runs.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;

use crate::core::layout;
use crate::core::types::Task;

const INVESTIGATE_TEMPLATE: &str = include_str!("prompts/investigate.md");
const ADHOC_TEMPLATE: &str = include_str!("prompts/adhoc.md");

const REDACTED_HEADER: &str = "[redacted-header]";

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)x-anthropic-[a-z0-9_-]*").expect("valid regex"));

/// Values substituted into the prompt templates.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub job_id: &'a str,
    pub workspace: &'a str,
    pub run_number: u32,
    pub task: &'a Task,
    /// Rendered issue markdown; used for issue tasks.
    pub issue_context: Option<&'a str>,
    pub has_repro: bool,
    pub create_pr: bool,
    pub repo: &'a str,
    /// Extra steering text for this run (`-p`).
    pub steering: Option<&'a str>,
    /// Helper scripts deployed to `<workspace>/scripts`.
    pub skills: &'a [String],
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("investigate", INVESTIGATE_TEMPLATE)
            .expect("investigate template should be valid");
        env.add_template("adhoc", ADHOC_TEMPLATE)
            .expect("adhoc template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let job_dir = layout::job_dir(input.workspace, input.job_id);
        let worktree = layout::worktree_dir(input.workspace, input.job_id);
        let steering = input.steering.map(str::trim).filter(|s| !s.is_empty());
        let name = if input.task.issue_number.is_some() {
            "investigate"
        } else {
            "adhoc"
        };
        let template = self.env.get_template(name)?;
        let rendered = template.render(context! {
            job_id => input.job_id,
            workspace => input.workspace,
            job_dir => job_dir,
            worktree => worktree,
            run_number => input.run_number,
            issue_number => input.task.issue_number,
            issue_context => input.issue_context.map(sanitize_for_api),
            task_description => input.task.description.as_deref().map(sanitize_for_api),
            has_repro => input.has_repro,
            create_pr => input.create_pr,
            repo => input.repo,
            steering => steering,
            scripts_dir => layout::scripts_dir(input.workspace),
            skills => input.skills,
        })?;
        Ok(rendered)
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Render the system prompt: the investigation template for issue tasks,
/// the freeform template otherwise.
pub fn render_system_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let mut rendered = ENGINE.render(input)?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

/// Redact header-like tokens the agent's API rejects in prompt text.
pub fn sanitize_for_api(text: &str) -> String {
    HEADER_RE.replace_all(text, REDACTED_HEADER).into_owned()
}

/// The `-p` message that points the agent at its system prompt.
pub fn agent_message(task: &Task) -> &'static str {
    if task.issue_number.is_some() {
        crate::io::agent::ISSUE_MESSAGE
    } else {
        crate::io::agent::ADHOC_MESSAGE
    }
}
