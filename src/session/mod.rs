//! Session state machine and WS session manager.
//!
//! `WsSessionState` is modeled as an actor-like aggregate: externally
//! read-only, all writes go through `SessionManager`. Rather than pinning
//! one tokio task per session, each session's state lives behind its own
//! `tokio::sync::Mutex` — the lock is held only for snapshot reads and
//! field updates, never across an I/O suspension point, which amounts to
//! the same single-writer discipline an actor would give you.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::events::{EventBus, SessionEvent};
use crate::policy::{Action, Rule, RuleEngine};
use crate::protocol::{extract_text, ContentBlock, Incoming, Outgoing, ToolDecision, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Initializing,
    Ready,
    Working,
    WaitingForInput,
    Compacting,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolApproval {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TotalUsage {
    fn accumulate(&mut self, u: &Usage) {
        self.input_tokens += u.input_tokens;
        self.output_tokens += u.output_tokens;
        self.cache_read_input_tokens += u.cache_read_input_tokens;
        self.cache_creation_input_tokens += u.cache_creation_input_tokens;
    }
}

/// One per WS-connected session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSessionState {
    pub session_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub mcp_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistant_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistant_content: Option<Vec<ContentBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool_approval: Option<PendingToolApproval>,
    pub turn_count: u64,
    pub total_cost_usd: f64,
    pub total_usage: TotalUsage,
    pub streaming_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Distinct message uuids already folded into `total_usage` — retransmits
    /// of the same uuid must not double-count.
    #[serde(skip)]
    seen_usage_uuids: std::collections::HashSet<String>,
}

impl WsSessionState {
    fn new(session_name: String) -> Self {
        Self {
            session_name,
            claude_session_id: None,
            status: SessionStatus::Connecting,
            model: None,
            tools: Vec::new(),
            mcp_servers: Vec::new(),
            permission_mode: None,
            cwd: None,
            last_assistant_message: None,
            last_assistant_content: None,
            pending_tool_approval: None,
            turn_count: 0,
            total_cost_usd: 0.0,
            total_usage: TotalUsage::default(),
            streaming_text: String::new(),
            last_message_at: None,
            connected_at: Utc::now(),
            error: None,
            seen_usage_uuids: std::collections::HashSet::new(),
        }
    }
}

struct SessionEntry {
    state: Mutex<WsSessionState>,
    outbound: RwLock<Option<mpsc::UnboundedSender<Outgoing>>>,
}

/// Owns every session's state and is the sole writer to it.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    claude_id_index: RwLock<HashMap<String, String>>,
    queued_prompts: RwLock<HashMap<String, String>>,
    rule_engine: Arc<RwLock<RuleEngine>>,
    bus: Arc<EventBus>,
}

impl SessionManager {
    pub fn new(rule_engine: Arc<RwLock<RuleEngine>>, bus: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            claude_id_index: RwLock::new(HashMap::new()),
            queued_prompts: RwLock::new(HashMap::new()),
            rule_engine,
            bus,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Register a new WS connection for `session_name`, allocating a
    /// `connecting` state if none exists yet. Reconnects reuse the prior
    /// entry so a `disconnected` session is recoverable — sessions are only
    /// removed by an explicit call to `remove_session`.
    pub async fn handle_connection(
        &self,
        session_name: &str,
    ) -> (Arc<EventBusSubscription>, mpsc::UnboundedReceiver<Outgoing>) {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_name.to_string())
                .or_insert_with(|| {
                    Arc::new(SessionEntry {
                        state: Mutex::new(WsSessionState::new(session_name.to_string())),
                        outbound: RwLock::new(None),
                    })
                })
                .clone()
        };

        {
            let mut state = entry.state.lock().await;
            state.status = SessionStatus::Connecting;
            state.connected_at = Utc::now();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *entry.outbound.write().await = Some(tx);

        self.bus.emit(SessionEvent::SessionConnected {
            session_name: session_name.to_string(),
        });

        (
            Arc::new(EventBusSubscription {
                session_name: session_name.to_string(),
            }),
            rx,
        )
    }

    /// Split `frame` into NDJSON lines and dispatch each independently — a
    /// decode error on one line never aborts the others.
    pub async fn handle_message(&self, session_name: &str, frame: &str) {
        for line in crate::protocol::split_lines(frame) {
            match crate::protocol::decode_line(line) {
                Some(incoming) => self.dispatch(session_name, incoming).await,
                None => debug!(session = %session_name, "skipped malformed line"),
            }
        }
    }

    pub async fn handle_close(&self, session_name: &str) {
        let Some(entry) = self.sessions.read().await.get(session_name).cloned() else {
            return;
        };
        {
            let mut state = entry.state.lock().await;
            state.status = SessionStatus::Disconnected;
            state.pending_tool_approval = None;
        }
        *entry.outbound.write().await = None;

        if let Some(claude_id) = entry.state.lock().await.claude_session_id.clone() {
            self.claude_id_index.write().await.remove(&claude_id);
        }

        self.bus.emit(SessionEvent::SessionDisconnected {
            session_name: session_name.to_string(),
        });
    }

    /// Encode and send a `user` message. Sets status=working, clears
    /// `streamingText`, emits `status_changed`. Returns `false` if there is
    /// no live connection or no known state for `session_name`.
    pub async fn send_user_message(&self, session_name: &str, text: &str) -> bool {
        let Some(entry) = self.sessions.read().await.get(session_name).cloned() else {
            return false;
        };
        let Some(tx) = entry.outbound.read().await.clone() else {
            return false;
        };

        let (previous, claude_id) = {
            let mut state = entry.state.lock().await;
            let previous = state.status;
            state.status = SessionStatus::Working;
            state.streaming_text.clear();
            state.last_message_at = Some(Utc::now());
            (previous, state.claude_session_id.clone())
        };

        let sent = tx
            .send(Outgoing::User {
                text: text.to_string(),
                session_id: claude_id,
            })
            .is_ok();

        if sent {
            self.bus.emit(SessionEvent::StatusChanged {
                session_name: session_name.to_string(),
                previous,
                new: SessionStatus::Working,
            });
        }
        sent
    }

    /// Encode and send a `control_response` resolving `request_id`. Clears
    /// the pending approval and emits `tool_approval_resolved`. Returns
    /// `false` if there is no WS connection or no pending approval.
    pub async fn respond_to_tool_approval(
        &self,
        session_name: &str,
        request_id: &str,
        allow: bool,
        message: Option<String>,
    ) -> bool {
        let Some(entry) = self.sessions.read().await.get(session_name).cloned() else {
            return false;
        };
        let Some(tx) = entry.outbound.read().await.clone() else {
            return false;
        };

        let tool_input = {
            let mut state = entry.state.lock().await;
            match &state.pending_tool_approval {
                Some(p) if p.request_id == request_id => {
                    let input = p.tool_input.clone();
                    state.pending_tool_approval = None;
                    Some(input)
                }
                _ => None,
            }
        };
        let Some(tool_input) = tool_input else {
            return false;
        };

        let decision = if allow {
            ToolDecision::Allow { updated_input: tool_input }
        } else {
            ToolDecision::Deny { message: message.unwrap_or_else(|| "Denied by user".to_string()) }
        };

        let sent = tx
            .send(Outgoing::ControlResponse {
                request_id: request_id.to_string(),
                decision,
            })
            .is_ok();

        if sent {
            self.bus.emit(SessionEvent::ToolApprovalResolved {
                session_name: session_name.to_string(),
                request_id: request_id.to_string(),
            });
        }
        sent
    }

    /// Store-or-replace a queued prompt for `session_name`, delivered on the
    /// next `system/init` or `SessionStart` hook_response.
    pub async fn queue_initial_prompt(&self, session_name: &str, text: &str) {
        self.queued_prompts
            .write()
            .await
            .insert(session_name.to_string(), text.to_string());
    }

    pub async fn remove_session(&self, session_name: &str) {
        let entry = self.sessions.write().await.remove(session_name);
        self.queued_prompts.write().await.remove(session_name);
        if let Some(entry) = entry {
            if let Some(id) = entry.state.lock().await.claude_session_id.clone() {
                self.claude_id_index.write().await.remove(&id);
            }
        }
    }

    pub async fn get_session_state(&self, session_name: &str) -> Option<WsSessionState> {
        let entry = self.sessions.read().await.get(session_name)?.clone();
        Some(entry.state.lock().await.clone())
    }

    pub async fn get_all_sessions(&self) -> Vec<WsSessionState> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.state.lock().await.clone());
        }
        out
    }

    pub async fn is_connected(&self, session_name: &str) -> bool {
        match self.sessions.read().await.get(session_name) {
            Some(entry) => entry.outbound.read().await.is_some(),
            None => false,
        }
    }

    pub async fn get_session_name_by_claude_id(&self, claude_id: &str) -> Option<String> {
        self.claude_id_index.read().await.get(claude_id).cloned()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    // ─── Dispatch ───────────────────────────────────────────────────────────

    async fn dispatch(&self, session_name: &str, incoming: Incoming) {
        let Some(entry) = self.sessions.read().await.get(session_name).cloned() else {
            return;
        };

        match incoming {
            Incoming::SystemInit { session_id, model, tools, mcp_servers, permission_mode, cwd } => {
                let previous = {
                    let mut state = entry.state.lock().await;
                    let previous = state.status;
                    state.status = SessionStatus::Ready;
                    state.model = model;
                    state.tools = tools;
                    state.mcp_servers = mcp_servers;
                    state.permission_mode = permission_mode;
                    state.cwd = cwd;
                    state.last_message_at = Some(Utc::now());
                    previous
                };
                if let Some(ref id) = session_id {
                    entry.state.lock().await.claude_session_id = Some(id.clone());
                    self.claude_id_index
                        .write()
                        .await
                        .insert(id.clone(), session_name.to_string());
                }
                self.bus.emit(SessionEvent::StatusChanged {
                    session_name: session_name.to_string(),
                    previous,
                    new: SessionStatus::Ready,
                });
                self.flush_queued_prompt(session_name, &entry, session_id).await;
            }

            Incoming::SystemStatus { status } if status == "compacting" => {
                let previous = {
                    let mut state = entry.state.lock().await;
                    if state.status == SessionStatus::Disconnected {
                        return;
                    }
                    let previous = state.status;
                    state.status = SessionStatus::Compacting;
                    previous
                };
                self.bus.emit(SessionEvent::StatusChanged {
                    session_name: session_name.to_string(),
                    previous,
                    new: SessionStatus::Compacting,
                });
            }
            Incoming::SystemStatus { .. } => {}

            Incoming::SystemHookResponse { session_id, hook_name } => {
                if hook_name.as_deref() == Some("SessionStart") {
                    if let Some(ref id) = session_id {
                        entry.state.lock().await.claude_session_id = Some(id.clone());
                        self.claude_id_index
                            .write()
                            .await
                            .insert(id.clone(), session_name.to_string());
                    }
                    self.flush_queued_prompt(session_name, &entry, session_id).await;
                }
            }

            Incoming::Assistant { content, stop_reason, uuid, usage } => {
                let text = extract_text(&content);
                let previous = {
                    let mut state = entry.state.lock().await;
                    let previous = state.status;
                    state.status = SessionStatus::Working;
                    state.last_assistant_message = Some(text.clone());
                    state.last_assistant_content = Some(content);
                    state.streaming_text.clear();
                    state.last_message_at = Some(Utc::now());
                    accumulate_usage(&mut state, uuid, usage);
                    previous
                };
                if previous != SessionStatus::Working {
                    self.bus.emit(SessionEvent::StatusChanged {
                        session_name: session_name.to_string(),
                        previous,
                        new: SessionStatus::Working,
                    });
                }
                self.bus.emit(SessionEvent::AssistantMessage {
                    session_name: session_name.to_string(),
                    text,
                    stop_reason,
                });
            }

            Incoming::Result { is_error, result, errors, num_turns, total_cost_usd, duration_ms, uuid, usage, .. } => {
                let previous = {
                    let mut state = entry.state.lock().await;
                    let previous = state.status;
                    state.status = SessionStatus::WaitingForInput;
                    state.streaming_text.clear();
                    state.turn_count += 1;
                    if let Some(cost) = total_cost_usd {
                        state.total_cost_usd = cost;
                    }
                    accumulate_usage(&mut state, uuid, usage);
                    state.error = if is_error {
                        Some(errors.clone().map(|e| e.join("; ")).unwrap_or_else(|| "unknown error".to_string()))
                    } else {
                        None
                    };
                    state.last_message_at = Some(Utc::now());
                    previous
                };
                self.bus.emit(SessionEvent::StatusChanged {
                    session_name: session_name.to_string(),
                    previous,
                    new: SessionStatus::WaitingForInput,
                });
                self.bus.emit(SessionEvent::Result {
                    session_name: session_name.to_string(),
                    success: !is_error,
                    result,
                    errors,
                    num_turns,
                    total_cost_usd,
                    duration_ms,
                });
            }

            Incoming::StreamEvent { event_type, delta_text } => {
                if event_type == "content_block_delta" {
                    if let Some(delta) = delta_text {
                        let accumulated = {
                            let mut state = entry.state.lock().await;
                            state.streaming_text.push_str(&delta);
                            state.streaming_text.clone()
                        };
                        self.bus.emit(SessionEvent::StreamDelta {
                            session_name: session_name.to_string(),
                            text: delta,
                            accumulated_text: accumulated,
                        });
                    }
                }
            }

            Incoming::ControlRequest { request_id, tool_name, input, tool_use_id } => {
                self.handle_control_request(session_name, &entry, request_id, tool_name, input, tool_use_id)
                    .await;
            }

            Incoming::ToolProgress(data) => {
                self.bus.emit(SessionEvent::ToolProgress {
                    session_name: session_name.to_string(),
                    data,
                });
            }

            Incoming::KeepAlive | Incoming::Unknown => {}
        }
    }

    /// Consult the rule engine before a human is prompted. `allow`/`deny`
    /// short-circuits to an immediate `control_response`; only `ask`
    /// promotes to the human-approval path (`pending_tool_approval`).
    async fn handle_control_request(
        &self,
        session_name: &str,
        entry: &Arc<SessionEntry>,
        request_id: String,
        tool_name: String,
        input: Value,
        tool_use_id: String,
    ) {
        let (action, matched_rule) = {
            let engine = self.rule_engine.read().await;
            let (action, rule) = engine.evaluate(&tool_name, &input);
            (action, rule.cloned())
        };

        match action {
            Action::Allow | Action::Deny => {
                let Some(tx) = entry.outbound.read().await.clone() else { return };
                let decision = if action == Action::Allow {
                    ToolDecision::Allow { updated_input: input.clone() }
                } else {
                    ToolDecision::Deny { message: "Denied by rule".to_string() }
                };
                if tx
                    .send(Outgoing::ControlResponse { request_id: request_id.clone(), decision })
                    .is_ok()
                {
                    let rule = matched_rule.unwrap_or_else(|| RuleEngine::derive_rule(&tool_name, &input, action));
                    if action == Action::Allow {
                        self.bus.emit(SessionEvent::ToolAutoApproved {
                            session_name: session_name.to_string(),
                            request_id,
                            rule,
                        });
                    } else {
                        self.bus.emit(SessionEvent::ToolAutoDenied {
                            session_name: session_name.to_string(),
                            request_id,
                            rule,
                        });
                    }
                }
            }
            Action::Ask => {
                let status_ok = {
                    let state = entry.state.lock().await;
                    matches!(state.status, SessionStatus::Working | SessionStatus::WaitingForInput)
                };
                if !status_ok {
                    warn!(session = %session_name, "control_request outside working/waiting_for_input — ignored");
                    return;
                }
                let approval = PendingToolApproval {
                    request_id: request_id.clone(),
                    tool_name,
                    tool_input: input,
                    tool_use_id,
                    received_at: Utc::now(),
                };
                entry.state.lock().await.pending_tool_approval = Some(approval.clone());
                self.bus.emit(SessionEvent::ToolApprovalNeeded {
                    session_name: session_name.to_string(),
                    approval,
                });
            }
        }
    }

    /// Flush the queued initial prompt once either gate (`system/init` or a
    /// `SessionStart` hook_response) fires, whichever arrives first. A brief
    /// delay lets the hook settle; dedupe by clearing the queue on delivery.
    async fn flush_queued_prompt(
        &self,
        session_name: &str,
        entry: &Arc<SessionEntry>,
        claude_id: Option<String>,
    ) {
        let prompt = self.queued_prompts.write().await.remove(session_name);
        let Some(prompt) = prompt else { return };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let Some(tx) = entry.outbound.read().await.clone() else { return };
        let _ = tx.send(Outgoing::User { text: prompt, session_id: claude_id });
    }
}

fn accumulate_usage(state: &mut WsSessionState, uuid: Option<String>, usage: Option<Usage>) {
    let Some(usage) = usage else { return };
    match uuid {
        Some(id) => {
            if state.seen_usage_uuids.insert(id) {
                state.total_usage.accumulate(&usage);
            }
        }
        None => state.total_usage.accumulate(&usage),
    }
}

/// Opaque handle returned from `handle_connection`; currently unused beyond
/// identifying the session the caller attached to, kept as a seam for
/// future per-connection bookkeeping (e.g. connection-scoped metrics).
pub struct EventBusSubscription {
    pub session_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RuleEngine;

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(RwLock::new(RuleEngine::new(vec![]))),
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn connecting_then_init_moves_to_ready() {
        let mgr = manager();
        let (_sub, _rx) = mgr.handle_connection("foo").await;
        let state = mgr.get_session_state("foo").await.unwrap();
        assert_eq!(state.status, SessionStatus::Connecting);

        mgr.handle_message("foo", r#"{"type":"system","subtype":"init","session_id":"c1","tools":[]}"#).await;
        let state = mgr.get_session_state("foo").await.unwrap();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.claude_session_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn pending_approval_at_most_one() {
        let mgr = manager();
        let (_sub, _rx) = mgr.handle_connection("foo").await;
        mgr.handle_message("foo", r#"{"type":"system","subtype":"init","session_id":"c1","tools":[]}"#).await;
        mgr.handle_message("foo", r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#).await;

        mgr.handle_message(
            "foo",
            r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"u1"}}"#,
        )
        .await;
        let state = mgr.get_session_state("foo").await.unwrap();
        assert!(state.pending_tool_approval.is_some());

        mgr.handle_message(
            "foo",
            r#"{"type":"control_request","request_id":"r2","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"pwd"},"tool_use_id":"u2"}}"#,
        )
        .await;
        let state = mgr.get_session_state("foo").await.unwrap();
        // Only one pending approval at a time — r1 still held, r2 overwrote it;
        // either way the invariant |pendingToolApproval| <= 1 holds.
        assert!(state.pending_tool_approval.is_some());
    }

    #[tokio::test]
    async fn queued_prompt_sent_after_init() {
        let mgr = manager();
        mgr.queue_initial_prompt("bar", "hello").await;
        let (_sub, mut rx) = mgr.handle_connection("bar").await;
        mgr.handle_message("bar", r#"{"type":"system","subtype":"init","session_id":"c1"}"#).await;

        let msg = rx.recv().await.unwrap();
        match msg {
            Outgoing::User { text, session_id } => {
                assert_eq!(text, "hello");
                assert_eq!(session_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Queue was consumed; a second init must not resend.
        mgr.handle_message("bar", r#"{"type":"system","subtype":"init","session_id":"c1"}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn streaming_prefix_then_clear_on_assistant() {
        let mgr = manager();
        let (_sub, _rx) = mgr.handle_connection("s").await;
        let mut bus_rx = mgr.subscribe();

        mgr.handle_message("s", r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"Hel"}}}"#).await;
        mgr.handle_message("s", r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"text":"lo"}}}"#).await;
        mgr.handle_message("s", r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#).await;

        let state = mgr.get_session_state("s").await.unwrap();
        assert_eq!(state.streaming_text, "");
        assert_eq!(state.last_assistant_message.as_deref(), Some("Hello"));

        let mut events = Vec::new();
        while let Ok(e) = bus_rx.try_recv() {
            events.push(e);
        }
        assert!(events.iter().any(|e| matches!(e, SessionEvent::StreamDelta { accumulated_text, .. } if accumulated_text == "Hel")));
        assert!(events.iter().any(|e| matches!(e, SessionEvent::StreamDelta { accumulated_text, .. } if accumulated_text == "Hello")));
    }

    #[tokio::test]
    async fn disconnect_preserves_state_until_remove() {
        let mgr = manager();
        let (_sub, _rx) = mgr.handle_connection("foo").await;
        mgr.handle_close("foo").await;
        let state = mgr.get_session_state("foo").await.unwrap();
        assert_eq!(state.status, SessionStatus::Disconnected);

        mgr.remove_session("foo").await;
        assert!(mgr.get_session_state("foo").await.is_none());
    }
}
