//! Mapping of app-server thread items and approvals onto driver events.

use serde_json::{Value, json};

use agent_bridge_core::{AgentEvent, ContentBlock, PermissionBehavior, Usage};

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn u64_field(value: &Value, snake: &str, camel: &str) -> u64 {
    value
        .get(camel)
        .or_else(|| value.get(snake))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Commands arrive either as a shell string or an argv array.
fn command_text(item: &Value) -> String {
    match item.get("command") {
        Some(Value::String(command)) => command.clone(),
        Some(Value::Array(argv)) => argv
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// `item/started`: tool invocations become a `tool_use` message.
pub fn item_started(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").unwrap_or_default().to_string();
    let (name, input) = match str_field(item, "type")? {
        "commandExecution" => (
            "Bash".to_string(),
            json!({"command": command_text(item), "cwd": item.get("cwd")}),
        ),
        "fileChange" => {
            let paths: Vec<&str> = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| changes.iter().filter_map(|c| str_field(c, "path")).collect())
                .unwrap_or_default();
            ("Edit".to_string(), json!({"paths": paths}))
        }
        "mcpToolCall" => (
            str_field(item, "tool").unwrap_or("mcp").to_string(),
            item.get("arguments").cloned().unwrap_or(Value::Null),
        ),
        "webSearch" => (
            "WebSearch".to_string(),
            json!({"query": item.get("query")}),
        ),
        _ => return None,
    };
    Some(AgentEvent::Message {
        content: vec![ContentBlock::ToolUse { id, name, input }],
    })
}

/// `item/completed`: final agent text or tool output.
pub fn item_completed(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").unwrap_or_default().to_string();
    let failed = matches!(str_field(item, "status"), Some("failed" | "declined"));

    let result = |content: Value, is_error: bool| AgentEvent::ToolResults {
        content: vec![ContentBlock::ToolResult {
            tool_use_id: id.clone(),
            content,
            is_error,
        }],
    };

    match str_field(item, "type")? {
        "agentMessage" => {
            let text = str_field(item, "text").unwrap_or_default();
            (!text.is_empty()).then(|| AgentEvent::Message {
                content: vec![ContentBlock::text(text)],
            })
        }
        "commandExecution" => {
            let exit_code = item.get("exitCode").and_then(Value::as_i64);
            let output = str_field(item, "aggregatedOutput").unwrap_or_default();
            Some(result(
                json!(output),
                failed || exit_code.is_some_and(|code| code != 0),
            ))
        }
        "fileChange" => Some(result(
            item.get("changes").cloned().unwrap_or(Value::Null),
            failed,
        )),
        "mcpToolCall" => {
            let error = item.get("error").filter(|e| !e.is_null());
            let content = error
                .or_else(|| item.get("result"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(result(content, failed || error.is_some()))
        }
        _ => None,
    }
}

/// `thread/tokenUsage/updated`: usage of the latest turn.
///
/// Reported input tokens include cached ones; they are split so that the
/// context computation does not count the cache twice.
pub fn token_usage(params: &Value) -> Option<Usage> {
    let usage = params
        .get("tokenUsage")
        .or_else(|| params.get("token_usage"))?;
    let last = usage
        .get("last")
        .or_else(|| usage.get("total"))
        .unwrap_or(usage);

    let input = u64_field(last, "input_tokens", "inputTokens");
    let cached = u64_field(last, "cached_input_tokens", "cachedInputTokens");
    Some(Usage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: u64_field(last, "output_tokens", "outputTokens"),
        cache_read_input_tokens: cached,
    })
}

/// Which approval dialect a request used; they spell decisions differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalFlavor {
    /// `item/*/requestApproval`.
    Item,
    /// `execCommandApproval` / `applyPatchApproval`.
    Legacy,
}

impl ApprovalFlavor {
    pub fn decision(self, behavior: PermissionBehavior) -> Value {
        let decision = match (self, behavior) {
            (Self::Item, PermissionBehavior::Allow) => "accept",
            (Self::Item, PermissionBehavior::Deny) => "decline",
            (Self::Legacy, PermissionBehavior::Allow) => "approved",
            (Self::Legacy, PermissionBehavior::Deny) => "denied",
        };
        json!({"decision": decision})
    }

    pub fn cancel(self) -> Value {
        let decision = match self {
            Self::Item => "cancel",
            Self::Legacy => "abort",
        };
        json!({"decision": decision})
    }
}

/// A server request asking for approval, as `(tool name, tool input, flavor)`.
pub fn approval_request(method: &str, params: &Value) -> Option<(String, Value, ApprovalFlavor)> {
    let (tool, flavor) = match method {
        "item/commandExecution/requestApproval" => ("Bash", ApprovalFlavor::Item),
        "item/fileChange/requestApproval" => ("Edit", ApprovalFlavor::Item),
        "execCommandApproval" => ("Bash", ApprovalFlavor::Legacy),
        "applyPatchApproval" => ("Edit", ApprovalFlavor::Legacy),
        _ => return None,
    };

    let mut input = serde_json::Map::new();
    if tool == "Bash" {
        input.insert("command".into(), json!(command_text(params)));
    }
    for key in ["cwd", "reason", "itemId", "fileChanges", "grantRoot"] {
        if let Some(value) = params.get(key).filter(|v| !v.is_null()) {
            input.insert(key.into(), value.clone());
        }
    }
    Some((tool.to_string(), Value::Object(input), flavor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_items_round_out_as_tool_use_and_result() {
        let started = json!({"type": "commandExecution", "id": "c1", "command": ["cargo", "test"], "cwd": "/w"});
        let Some(AgentEvent::Message { content }) = item_started(&started) else {
            panic!("expected tool use");
        };
        assert!(matches!(&content[0], ContentBlock::ToolUse { name, input, .. }
            if name == "Bash" && input["command"] == "cargo test"));

        let completed = json!({"type": "commandExecution", "id": "c1", "status": "completed", "aggregatedOutput": "boom", "exitCode": 101});
        let Some(AgentEvent::ToolResults { content }) = item_completed(&completed) else {
            panic!("expected tool result");
        };
        assert!(matches!(&content[0], ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "c1"));
    }

    #[test]
    fn agent_message_completion_is_final_text() {
        let item = json!({"type": "agentMessage", "id": "m1", "text": "Hello"});
        assert_eq!(
            item_completed(&item),
            Some(AgentEvent::Message {
                content: vec![ContentBlock::text("Hello")]
            })
        );
        assert_eq!(item_completed(&json!({"type": "reasoning", "id": "r"})), None);
    }

    #[test]
    fn usage_splits_cached_input() {
        let usage = token_usage(&json!({
            "threadId": "t",
            "tokenUsage": {
                "total": {"inputTokens": 9000, "cachedInputTokens": 4000, "outputTokens": 700},
                "last": {"inputTokens": 3000, "cachedInputTokens": 1000, "outputTokens": 200}
            }
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 2000);
        assert_eq!(usage.cache_read_input_tokens, 1000);
        assert_eq!(usage.output_tokens, 200);
        assert_eq!(usage.context_tokens(), 3000);
    }

    #[test]
    fn approvals_use_their_dialect() {
        let (tool, input, flavor) = approval_request(
            "item/commandExecution/requestApproval",
            &json!({"threadId": "t", "itemId": "c1", "command": "rm -rf build", "reason": "cleanup"}),
        )
        .unwrap();
        assert_eq!(tool, "Bash");
        assert_eq!(input["command"], "rm -rf build");
        assert_eq!(flavor.decision(PermissionBehavior::Allow)["decision"], "accept");

        let (_, _, legacy) = approval_request("applyPatchApproval", &json!({})).unwrap();
        assert_eq!(legacy.decision(PermissionBehavior::Deny)["decision"], "denied");
        assert_eq!(legacy.cancel()["decision"], "abort");

        assert!(approval_request("item/tool/requestUserInput", &json!({})).is_none());
    }
}
