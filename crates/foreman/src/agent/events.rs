//! Tool-event extraction from agent output.
//!
//! Two parsers share one output type: the streaming-JSON parser for
//! agents launched with structured output, and a regex scraper for plain
//! text. The supervisor picks which to try first based on whether
//! streaming JSON was requested; any line that is not valid JSON falls
//! back to the scraper.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// One structured tool invocation observed in the agent's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    /// Canonical tool name: lowercased, with file-suffixed aliases folded
    /// (`edit_file` → `edit`, `write_file` → `write`, `read_file` → `read`).
    pub tool: String,
    pub target_file: Option<String>,
    pub command: Option<String>,
    pub pattern: Option<String>,
    pub description: String,
}

impl AgentEvent {
    pub fn is_read(&self) -> bool {
        self.tool == "read"
    }
}

/// Fold an agent-reported tool name to its canonical form.
fn canonical_tool(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    match lowered.as_str() {
        "edit_file" => "edit".to_string(),
        "write_file" => "write".to_string(),
        "read_file" => "read".to_string(),
        _ => lowered,
    }
}

/// Internal bookkeeping tools that are noise in the event log.
fn is_internal_tool(canonical: &str) -> bool {
    canonical == "todo_write" || canonical.starts_with("mcp__")
}

fn render_description(event: &AgentEvent) -> String {
    if let Some(target) = &event.target_file {
        return format!("{} {}", event.tool, target);
    }
    if let Some(command) = &event.command {
        let mut shown = command.clone();
        if shown.len() > 120 {
            shown.truncate(120);
            shown.push('…');
        }
        return format!("{}: {}", event.tool, shown);
    }
    if let Some(pattern) = &event.pattern {
        return format!("{} /{}/", event.tool, pattern);
    }
    event.tool.clone()
}

/// Parse one streaming-JSON line into a tool event.
///
/// Returns `None` for non-JSON lines, non-`tool_use` objects, and
/// filtered internal tools.
pub fn parse_stream_line(line: &str) -> Option<AgentEvent> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }

    let tool = canonical_tool(value.get("name").and_then(Value::as_str)?);
    if is_internal_tool(&tool) {
        return None;
    }

    let input = value.get("input");
    let field = |keys: &[&str]| -> Option<String> {
        let input = input?;
        keys.iter()
            .find_map(|k| input.get(k).and_then(Value::as_str))
            .map(str::to_string)
    };

    let mut event = AgentEvent {
        tool,
        target_file: field(&["file_path", "path", "target_file"]),
        command: field(&["command"]),
        pattern: field(&["pattern"]),
        description: String::new(),
    };
    event.description = render_description(&event);
    Some(event)
}

static PLAIN_TOOL: LazyLock<Regex> = LazyLock::new(|| {
    // Lines like "● Read(src/main.rs)" or "Bash(cargo test)".
    Regex::new(r"(?i)^[●⏺*\s]*(read|edit|write|bash|grep|glob)\s*\(([^)]*)\)")
        .expect("static regex")
});

/// Regex fallback for agents without structured output.
pub fn parse_plain_line(line: &str) -> Option<AgentEvent> {
    let caps = PLAIN_TOOL.captures(line)?;
    let tool = canonical_tool(&caps[1]);
    let arg = caps[2].trim();
    let arg = (!arg.is_empty()).then(|| arg.to_string());

    let mut event = AgentEvent {
        target_file: None,
        command: None,
        pattern: None,
        description: String::new(),
        tool,
    };
    match event.tool.as_str() {
        "bash" => event.command = arg,
        "grep" | "glob" => event.pattern = arg,
        _ => event.target_file = arg,
    }
    event.description = render_description(&event);
    Some(event)
}
