//! Agent Client Protocol payloads and their mapping onto driver events.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};

use serde::Deserialize;
use serde_json::{Value, json};

use agent_bridge_core::{AgentEvent, ContentBlock, PermissionBehavior, ToolProgress};

use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS};

pub const PROTOCOL_VERSION: u64 = 1;

/// `initialize` params advertising what this client can do for the agent.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": {"readTextFile": true, "writeTextFile": true},
            "terminal": true,
        },
    })
}

/// Error answered to a reverse request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: i64,
    pub message: String,
}

impl ReplyError {
    pub fn invalid_params(e: impl std::fmt::Display) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: e.to_string(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: e.to_string(),
        }
    }
}

/// Deserialize reverse-request params, mapping failures to `-32602`.
pub fn params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, ReplyError> {
    serde_json::from_value(params).map_err(ReplyError::invalid_params)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    pub path: PathBuf,
    /// 1-based first line.
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalParams {
    pub terminal_id: String,
}

/// Relative paths are taken against the session's working directory.
pub fn resolve_path(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

pub async fn read_text_file(cwd: &Path, p: ReadTextFileParams) -> Result<Value, ReplyError> {
    let path = resolve_path(cwd, &p.path);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ReplyError::internal(format!("{}: {e}", path.display())))?;
    Ok(json!({"content": slice_lines(&content, p.line, p.limit)}))
}

pub async fn write_text_file(cwd: &Path, p: WriteTextFileParams) -> Result<Value, ReplyError> {
    let path = resolve_path(cwd, &p.path);
    tokio::fs::write(&path, p.content)
        .await
        .map_err(|e| ReplyError::internal(format!("{}: {e}", path.display())))?;
    Ok(json!({}))
}

fn slice_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.unwrap_or(1).saturating_sub(1);
    content
        .split_inclusive('\n')
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Outcome selecting one of the offered permission options.
pub fn selected(option_id: &str) -> Value {
    json!({"outcome": {"outcome": "selected", "optionId": option_id}})
}

/// Outcome for a request that will not be answered by an option.
pub fn cancelled() -> Value {
    json!({"outcome": {"outcome": "cancelled"}})
}

/// Pick the option matching `behavior`, preferring one-shot grants.
pub fn select_option(options: &[Value], behavior: PermissionBehavior) -> Option<String> {
    let preference: &[&str] = match behavior {
        PermissionBehavior::Allow => &["allow_once", "allow_always"],
        PermissionBehavior::Deny => &["reject_once", "reject_always"],
    };
    preference.iter().find_map(|kind| {
        options
            .iter()
            .find(|o| o.get("kind").and_then(Value::as_str) == Some(kind))
            .and_then(|o| o.get("optionId").and_then(Value::as_str))
            .map(str::to_string)
    })
}

/// `(tool name, tool input)` shown to the user for a permission request.
pub fn permission_subject(params: &Value) -> (String, Value) {
    let tool_call = params.get("toolCall").unwrap_or(&Value::Null);
    let name = tool_call
        .get("title")
        .or_else(|| tool_call.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or("tool")
        .to_string();
    let input = tool_call
        .get("rawInput")
        .cloned()
        .unwrap_or_else(|| tool_call.clone());
    (name, input)
}

/// Tool calls seen in the current session, for progress timing.
#[derive(Debug, Default)]
pub struct ToolCalls {
    started: HashMap<String, (String, Instant)>,
}

impl ToolCalls {
    pub fn clear(&mut self) {
        self.started.clear();
    }

    /// Map one `session/update` payload to events.
    pub fn map_update(&mut self, update: &Value) -> Option<AgentEvent> {
        let kind = update.get("sessionUpdate").and_then(Value::as_str)?;
        match kind {
            "agent_message_chunk" => {
                let text = update.pointer("/content/text").and_then(Value::as_str)?;
                (!text.is_empty()).then(|| AgentEvent::Stream {
                    text: text.to_string(),
                })
            }
            "tool_call" => {
                let id = update.get("toolCallId").and_then(Value::as_str)?.to_string();
                let name = update
                    .get("title")
                    .or_else(|| update.get("kind"))
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                self.started.insert(id.clone(), (name.clone(), Instant::now()));
                Some(AgentEvent::Message {
                    content: vec![ContentBlock::ToolUse {
                        id,
                        name,
                        input: update.get("rawInput").cloned().unwrap_or(Value::Null),
                    }],
                })
            }
            "tool_call_update" => self.tool_call_update(update),
            "plan" => {
                let entries = update.get("entries").and_then(Value::as_array)?;
                let done = entries
                    .iter()
                    .filter(|e| e.get("status").and_then(Value::as_str) == Some("completed"))
                    .count();
                Some(AgentEvent::Status {
                    status: format!("plan {done}/{}", entries.len()),
                })
            }
            other => {
                tracing::trace!(kind = other, "Ignoring session update");
                None
            }
        }
    }

    fn tool_call_update(&mut self, update: &Value) -> Option<AgentEvent> {
        let id = update.get("toolCallId").and_then(Value::as_str)?;
        match update.get("status").and_then(Value::as_str)? {
            "in_progress" => {
                let (name, started) = self.started.get(id)?;
                Some(AgentEvent::ToolProgress(ToolProgress {
                    tool_use_id: id.to_string(),
                    tool_name: name.clone(),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                }))
            }
            status @ ("completed" | "failed") => {
                self.started.remove(id);
                let content = update
                    .get("rawOutput")
                    .or_else(|| update.get("content"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some(AgentEvent::ToolResults {
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: id.to_string(),
                        content,
                        is_error: status == "failed",
                    }],
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_prefer_one_shot_grants() {
        let options = vec![
            json!({"optionId": "always", "kind": "allow_always", "name": "Always"}),
            json!({"optionId": "once", "kind": "allow_once", "name": "Once"}),
            json!({"optionId": "no", "kind": "reject_once", "name": "No"}),
        ];
        assert_eq!(
            select_option(&options, PermissionBehavior::Allow).as_deref(),
            Some("once")
        );
        assert_eq!(
            select_option(&options, PermissionBehavior::Deny).as_deref(),
            Some("no")
        );
        assert_eq!(select_option(&options[..2], PermissionBehavior::Deny), None);
    }

    #[test]
    fn tool_call_lifecycle_maps_to_use_progress_and_result() {
        let mut tools = ToolCalls::default();
        let started = tools
            .map_update(&json!({"sessionUpdate": "tool_call", "toolCallId": "t1", "title": "Read file", "kind": "read", "status": "pending", "rawInput": {"path": "a.rs"}}))
            .unwrap();
        assert!(matches!(started, AgentEvent::Message { ref content }
            if matches!(&content[0], ContentBlock::ToolUse { name, .. } if name == "Read file")));

        let progress = tools
            .map_update(&json!({"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "in_progress"}))
            .unwrap();
        assert!(matches!(progress, AgentEvent::ToolProgress(ToolProgress { ref tool_name, .. }) if tool_name == "Read file"));

        let done = tools
            .map_update(&json!({"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "failed", "rawOutput": "denied"}))
            .unwrap();
        assert!(matches!(done, AgentEvent::ToolResults { ref content }
            if matches!(&content[0], ContentBlock::ToolResult { is_error: true, .. })));

        assert_eq!(
            tools.map_update(&json!({"sessionUpdate": "tool_call_update", "toolCallId": "t1", "status": "in_progress"})),
            None
        );
    }

    #[test]
    fn message_chunks_stream() {
        let mut tools = ToolCalls::default();
        assert_eq!(
            tools.map_update(&json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hi"}})),
            Some(AgentEvent::Stream { text: "Hi".into() })
        );
        assert_eq!(
            tools.map_update(&json!({"sessionUpdate": "available_commands_update", "availableCommands": []})),
            None
        );
    }

    #[test]
    fn line_window_is_one_based() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(slice_lines(text, Some(2), Some(2)), "b\nc\n");
        assert_eq!(slice_lines(text, None, Some(1)), "a\n");
        assert_eq!(slice_lines(text, None, None), text);
    }

    #[tokio::test]
    async fn file_requests_resolve_relative_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        write_text_file(
            dir.path(),
            params(json!({"sessionId": "s", "path": "notes.txt", "content": "one\ntwo\n"})).unwrap(),
        )
        .await
        .unwrap();

        let read = read_text_file(
            dir.path(),
            params(json!({"sessionId": "s", "path": dir.path().join("notes.txt"), "line": 2})).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(read["content"], "two\n");

        let missing = read_text_file(
            dir.path(),
            params(json!({"sessionId": "s", "path": "nope.txt"})).unwrap(),
        )
        .await;
        assert_eq!(missing.unwrap_err().code, INTERNAL_ERROR);
        assert_eq!(
            params::<ReadTextFileParams>(json!({"sessionId": "s"})).unwrap_err().code,
            INVALID_PARAMS
        );
    }
}
