//! NDJSON framing and discriminated-union decode of the CLI↔server wire
//! protocol (`--sdk-url`).
//!
//! Wire format: one JSON object per line, newline-terminated; a single text
//! frame may carry several lines; empty lines are ignored. Malformed lines
//! or unknown `type`/`subtype` values are never fatal — the caller logs and
//! skips them, the connection stays open.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Split a WS text frame into NDJSON lines, ignoring blank lines.
pub fn split_lines(frame: &str) -> impl Iterator<Item = &str> {
    frame.lines().filter(|l| !l.trim().is_empty())
}

/// A single ordered content block within an `assistant`/`user` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

/// Concatenate the text of every `Text` block with newline separators,
/// preserving order.
pub fn extract_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decoded CLI→server lines, keyed by `type` and (for a few types) `subtype`.
///
/// `Unknown` absorbs any `type` this codec does not need to act on — the
/// decode contract requires unknown types/subtypes to be accepted silently,
/// never treated as an error.
#[derive(Debug, Clone)]
pub enum Incoming {
    SystemInit {
        session_id: Option<String>,
        model: Option<String>,
        tools: Vec<String>,
        mcp_servers: Vec<String>,
        permission_mode: Option<String>,
        cwd: Option<String>,
    },
    SystemStatus {
        status: String,
    },
    SystemHookResponse {
        session_id: Option<String>,
        hook_name: Option<String>,
    },
    Assistant {
        content: Vec<ContentBlock>,
        stop_reason: Option<String>,
        uuid: Option<String>,
        usage: Option<Usage>,
    },
    Result {
        subtype: String,
        is_error: bool,
        result: Option<String>,
        errors: Option<Vec<String>>,
        num_turns: Option<u64>,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        uuid: Option<String>,
        usage: Option<Usage>,
    },
    StreamEvent {
        event_type: String,
        delta_text: Option<String>,
    },
    ControlRequest {
        request_id: String,
        tool_name: String,
        input: Value,
        tool_use_id: String,
    },
    ToolProgress(Value),
    KeepAlive,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Decode one NDJSON line. Returns `None` on a JSON parse failure — the
/// caller logs and skips; the connection is never closed for this reason.
pub fn decode_line(line: &str) -> Option<Incoming> {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(err = %e, "malformed protocol line — skipped");
            return None;
        }
    };
    Some(decode_value(&v))
}

fn decode_value(v: &Value) -> Incoming {
    let ty = v.get("type").and_then(Value::as_str).unwrap_or("");
    match ty {
        "system" => decode_system(v),
        "assistant" => decode_assistant(v),
        "result" => decode_result(v),
        "stream_event" => decode_stream_event(v),
        "control_request" => decode_control_request(v),
        "tool_progress" => Incoming::ToolProgress(v.clone()),
        "keep_alive" => Incoming::KeepAlive,
        other => {
            debug!(ty = %other, "unknown protocol type — skipped");
            Incoming::Unknown
        }
    }
}

fn decode_system(v: &Value) -> Incoming {
    match v.get("subtype").and_then(Value::as_str).unwrap_or("") {
        "init" => Incoming::SystemInit {
            session_id: v.get("session_id").and_then(Value::as_str).map(String::from),
            model: v.get("model").and_then(Value::as_str).map(String::from),
            tools: v
                .get("tools")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            mcp_servers: v
                .get("mcp_servers")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(|x| {
                            x.get("name")
                                .and_then(Value::as_str)
                                .or_else(|| x.as_str())
                                .map(String::from)
                        })
                        .collect()
                })
                .unwrap_or_default(),
            permission_mode: v
                .get("permission_mode")
                .and_then(Value::as_str)
                .map(String::from),
            cwd: v.get("cwd").and_then(Value::as_str).map(String::from),
        },
        "status" => Incoming::SystemStatus {
            status: v
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "hook_response" => Incoming::SystemHookResponse {
            session_id: v.get("session_id").and_then(Value::as_str).map(String::from),
            hook_name: v.get("hook_name").and_then(Value::as_str).map(String::from),
        },
        other => {
            debug!(subtype = %other, "unknown system subtype — skipped");
            Incoming::Unknown
        }
    }
}

fn decode_assistant(v: &Value) -> Incoming {
    let content: Vec<ContentBlock> = v
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| v.get("content"))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();
    Incoming::Assistant {
        content,
        stop_reason: v.get("stop_reason").and_then(Value::as_str).map(String::from),
        uuid: v.get("uuid").and_then(Value::as_str).map(String::from),
        usage: v
            .get("message")
            .and_then(|m| m.get("usage"))
            .or_else(|| v.get("usage"))
            .and_then(|u| serde_json::from_value(u.clone()).ok()),
    }
}

fn decode_result(v: &Value) -> Incoming {
    let subtype = v
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("success")
        .to_string();
    Incoming::Result {
        is_error: subtype.starts_with("error") || v.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        result: v.get("result").and_then(Value::as_str).map(String::from),
        errors: v
            .get("errors")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect()),
        num_turns: v.get("num_turns").and_then(Value::as_u64),
        total_cost_usd: v.get("total_cost_usd").and_then(Value::as_f64),
        duration_ms: v.get("duration_ms").and_then(Value::as_u64),
        uuid: v.get("uuid").and_then(Value::as_str).map(String::from),
        usage: v.get("usage").and_then(|u| serde_json::from_value(u.clone()).ok()),
        subtype,
    }
}

fn decode_stream_event(v: &Value) -> Incoming {
    let event_type = v
        .get("event")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let delta_text = v
        .get("event")
        .and_then(|e| e.get("delta"))
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
        .map(String::from);
    Incoming::StreamEvent { event_type, delta_text }
}

fn decode_control_request(v: &Value) -> Incoming {
    let req = v.get("request").cloned().unwrap_or(Value::Null);
    Incoming::ControlRequest {
        request_id: v
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tool_name: req
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input: req.get("input").cloned().unwrap_or(Value::Null),
        tool_use_id: req
            .get("tool_use_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Outgoing server→CLI frames. Each encodes to one newline-terminated JSON line.
#[derive(Debug, Clone)]
pub enum Outgoing {
    User { text: String, session_id: Option<String> },
    ControlResponse {
        request_id: String,
        decision: ToolDecision,
    },
    ControlCancelRequest { request_id: String },
    UpdateEnvironmentVariables(Value),
    KeepAlive,
}

#[derive(Debug, Clone)]
pub enum ToolDecision {
    Allow { updated_input: Value },
    Deny { message: String },
}

/// Encode one outgoing frame as a newline-terminated JSON line.
pub fn encode_line(msg: &Outgoing) -> String {
    let v = match msg {
        Outgoing::User { text, session_id } => serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
            "session_id": session_id,
        }),
        Outgoing::ControlResponse { request_id, decision } => {
            let response = match decision {
                ToolDecision::Allow { updated_input } => serde_json::json!({
                    "behavior": "allow",
                    "updatedInput": updated_input,
                }),
                ToolDecision::Deny { message } => serde_json::json!({
                    "behavior": "deny",
                    "message": message,
                }),
            };
            serde_json::json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": response,
                }
            })
        }
        Outgoing::ControlCancelRequest { request_id } => serde_json::json!({
            "type": "control_cancel_request",
            "request_id": request_id,
        }),
        Outgoing::UpdateEnvironmentVariables(vars) => serde_json::json!({
            "type": "update_environment_variables",
            "variables": vars,
        }),
        Outgoing::KeepAlive => serde_json::json!({ "type": "keep_alive" }),
    };
    format!("{}\n", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_system_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"c1","tools":["Bash"]}"#;
        match decode_line(line).unwrap() {
            Incoming::SystemInit { session_id, tools, .. } => {
                assert_eq!(session_id.as_deref(), Some("c1"));
                assert_eq!(tools, vec!["Bash".to_string()]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn empty_tools_list_is_accepted() {
        let line = r#"{"type":"system","subtype":"init","session_id":"c1","tools":[]}"#;
        match decode_line(line).unwrap() {
            Incoming::SystemInit { tools, .. } => assert!(tools.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_skipped_not_errored() {
        let line = r#"{"type":"something_new","foo":"bar"}"#;
        assert!(matches!(decode_line(line), Some(Incoming::Unknown)));
    }

    #[test]
    fn malformed_json_returns_none() {
        assert!(decode_line("{not json").is_none());
    }

    #[test]
    fn decodes_control_request() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls -la"},"tool_use_id":"u1"}}"#;
        match decode_line(line).unwrap() {
            Incoming::ControlRequest { request_id, tool_name, tool_use_id, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(tool_use_id, "u1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn control_response_encodes_matching_request_id() {
        let out = Outgoing::ControlResponse {
            request_id: "r1".into(),
            decision: ToolDecision::Allow {
                updated_input: serde_json::json!({"command": "ls -la"}),
            },
        };
        let line = encode_line(&out);
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["response"]["request_id"], "r1");
        assert_eq!(v["response"]["response"]["behavior"], "allow");
    }

    #[test]
    fn extract_text_joins_text_blocks_in_order() {
        let blocks = vec![
            ContentBlock::Text { text: "Hel".into() },
            ContentBlock::ToolUse { id: "1".into(), name: "Bash".into(), input: Value::Null },
            ContentBlock::Text { text: "lo".into() },
        ];
        assert_eq!(extract_text(&blocks), "Hel\nlo");
    }

    #[test]
    fn split_lines_ignores_blank_lines() {
        let frame = "{\"a\":1}\n\n{\"b\":2}\n";
        let lines: Vec<&str> = split_lines(frame).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }
}
