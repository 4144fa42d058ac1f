//! Process-local event bus.
//!
//! A single `tokio::sync::broadcast` channel shared by every WS-connected
//! session. Events carry their own `session_name` so SSE/WS consumers
//! filter downstream rather than subscribing per-session. Delivery is
//! in-process, at-most-once: a slow subscriber that falls behind the
//! channel capacity has the oldest events dropped for it (`Lagged`) rather
//! than blocking the sender. Consumers log and keep draining instead of
//! treating lag as fatal.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::policy::Rule;
use crate::protocol::ContentBlock;
use crate::session::{PendingToolApproval, SessionStatus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    SessionConnected { session_name: String },
    SessionDisconnected { session_name: String },
    StatusChanged { session_name: String, previous: SessionStatus, new: SessionStatus },
    AssistantMessage {
        session_name: String,
        text: String,
        stop_reason: Option<String>,
    },
    StreamDelta { session_name: String, text: String, accumulated_text: String },
    ToolApprovalNeeded { session_name: String, approval: PendingToolApproval },
    ToolApprovalResolved { session_name: String, request_id: String },
    ToolAutoApproved { session_name: String, request_id: String, rule: Rule },
    ToolAutoDenied { session_name: String, request_id: String, rule: Rule },
    Result {
        session_name: String,
        success: bool,
        result: Option<String>,
        errors: Option<Vec<String>>,
        num_turns: Option<u64>,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    Error { session_name: String, message: String },
    ToolProgress { session_name: String, data: Value },
}

impl SessionEvent {
    pub fn session_name(&self) -> &str {
        match self {
            SessionEvent::SessionConnected { session_name }
            | SessionEvent::SessionDisconnected { session_name }
            | SessionEvent::StatusChanged { session_name, .. }
            | SessionEvent::AssistantMessage { session_name, .. }
            | SessionEvent::StreamDelta { session_name, .. }
            | SessionEvent::ToolApprovalNeeded { session_name, .. }
            | SessionEvent::ToolApprovalResolved { session_name, .. }
            | SessionEvent::ToolAutoApproved { session_name, .. }
            | SessionEvent::ToolAutoDenied { session_name, .. }
            | SessionEvent::Result { session_name, .. }
            | SessionEvent::Error { session_name, .. }
            | SessionEvent::ToolProgress { session_name, .. } => session_name,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event to every current subscriber. No subscribers is fine.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Drain one event from `rx`, logging (not erroring) on lag.
pub async fn recv_lossy(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Closed) => return None,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event bus lagged — slow consumer skipped events");
            }
        }
    }
}
