//! Wire format for events a worker pushes to the master.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEventType {
    WorkerRegistered,
    WorkerDeregistered,
    SessionCreated,
    SessionAttached,
    SessionDetached,
    SessionKilled,
    ClaudeStateChanged,
    GitChanges,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    #[serde(rename = "type")]
    pub event_type: WorkerEventType,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WorkerEvent {
    pub fn new(event_type: WorkerEventType, worker_id: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            worker_id: worker_id.into(),
            session_name: None,
            data: None,
        }
    }

    pub fn with_session(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
