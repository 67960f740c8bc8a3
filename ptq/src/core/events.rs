//! Rendering of the agent's stream-json log for humans.
//!
//! The agent writes one JSON event per line. Follow mode renders every event;
//! `peek` uses the one-line summaries.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Tool output longer than this is cut in follow mode.
pub const MAX_OUTPUT_LINES: usize = 30;

/// Summaries are cut to this many characters.
pub const SUMMARY_CHARS: usize = 200;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\r").expect("valid regex"));

/// Strip ANSI escapes and carriage returns.
pub fn clean(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Keep the first `max_lines` lines and note how many were dropped.
pub fn truncate(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    format!(
        "{}\n... ({} more lines)",
        lines[..max_lines].join("\n"),
        lines.len() - max_lines
    )
}

pub fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render one log line for follow mode. `None` for events with nothing to show.
pub fn render_event(line: &str) -> Option<String> {
    let line = clean(line.trim());
    if line.is_empty() {
        return None;
    }
    let Ok(event) = serde_json::from_str::<Value>(&line) else {
        return Some(line);
    };
    let mut out = Vec::new();
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            for block in content_blocks(&event) {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str)
                            && !text.is_empty()
                        {
                            out.push(clean(text));
                        }
                    }
                    Some("tool_use") => out.push(render_tool_use(block)),
                    _ => {}
                }
            }
        }
        Some("user") => {
            for block in content_blocks(&event) {
                if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                    continue;
                }
                let is_error = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    let content = tool_result_text(block);
                    out.push(indent(&truncate(&clean(&content), MAX_OUTPUT_LINES), "    ! "));
                    continue;
                }
                let stdout = event
                    .get("tool_use_result")
                    .and_then(|r| r.get("stdout"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !stdout.trim().is_empty() {
                    out.push(indent(&truncate(&clean(stdout), MAX_OUTPUT_LINES), "    "));
                }
            }
        }
        _ => {}
    }
    if out.is_empty() {
        None
    } else {
        Some(out.join("\n"))
    }
}

/// One-line summaries of a log line, used by `peek --log`.
pub fn summarize_event(line: &str) -> Vec<String> {
    let line = clean(line.trim());
    if line.is_empty() {
        return Vec::new();
    }
    let Ok(event) = serde_json::from_str::<Value>(&line) else {
        return vec![cut(&line, SUMMARY_CHARS)];
    };
    if event.get("type").and_then(Value::as_str) != Some("assistant") {
        return Vec::new();
    }
    let mut out = Vec::new();
    for block in content_blocks(&event) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str)
                    && !text.is_empty()
                {
                    out.push(cut(text, SUMMARY_CHARS));
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                out.push(name.to_string());
            }
            _ => {}
        }
    }
    out
}

fn content_blocks(event: &Value) -> impl Iterator<Item = &Value> {
    event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn render_tool_use(block: &Value) -> String {
    let tool = block.get("name").and_then(Value::as_str).unwrap_or("");
    let input = block.get("input");
    let field = |key: &str| {
        input
            .and_then(|i| i.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    match tool {
        "Bash" => format!("  $ {}", field("command")),
        "Read" => format!("  read {}", field("file_path")),
        "Edit" => format!("  edit {}", field("file_path")),
        "Write" => format!("  write {}", field("file_path")),
        "Grep" => format!("  grep {}", field("pattern")),
        "Glob" => format!("  glob {}", field("pattern")),
        other => format!("  {other}"),
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn cut(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_ansi_and_carriage_returns() {
        assert_eq!(clean("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(clean("line\r"), "line");
        assert_eq!(clean("plain text"), "plain text");
    }

    #[test]
    fn truncate_reports_dropped_lines() {
        assert_eq!(truncate("a\nb\nc", MAX_OUTPUT_LINES), "a\nb\nc");
        let text = (0..100)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = truncate(&text, 5);
        assert_eq!(out.matches('\n').count(), 5);
        assert!(out.ends_with("(95 more lines)"));
    }

    #[test]
    fn indent_prefixes_every_line() {
        assert_eq!(indent("a\nb", "    "), "    a\n    b");
        assert_eq!(indent("a\nb", ">> "), ">> a\n>> b");
    }

    #[test]
    fn renders_bash_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"python repro.py"}}]}}"#;
        assert_eq!(render_event(line).as_deref(), Some("  $ python repro.py"));
    }

    #[test]
    fn renders_tool_stdout_indented() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"ok"}]},"tool_use_result":{"stdout":"hello\nworld"}}"#;
        assert_eq!(
            render_event(line).as_deref(),
            Some("    hello\n    world")
        );
    }

    #[test]
    fn non_json_lines_pass_through() {
        assert_eq!(render_event("plain log").as_deref(), Some("plain log"));
        assert_eq!(render_event("   "), None);
    }

    #[test]
    fn summaries_list_text_and_tool_names() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the kernel"},{"type":"tool_use","name":"Grep","input":{"pattern":"foo"}}]}}"#;
        assert_eq!(
            summarize_event(line),
            vec!["Looking at the kernel".to_string(), "Grep".to_string()]
        );
        let system = r#"{"type":"system","subtype":"init"}"#;
        assert!(summarize_event(system).is_empty());
    }
}
