//! The logical `Session` record shared between a worker's local snapshot
//! and the master's merged view.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linear_issue: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub attached: bool,
    pub windows: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Derived fields, populated by the worker's poll loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_last_message: Option<String>,
}

impl Session {
    pub fn new(session_name: String, attached: bool, windows: u32) -> Self {
        Self {
            session_name,
            worktree_path: None,
            project_name: None,
            linear_issue: None,
            created: Utc::now(),
            host: None,
            attached,
            windows,
            title: None,
            claude_state: None,
            git_stats: None,
            claude_last_message: None,
        }
    }
}

pub type SessionMap = HashMap<String, Session>;
