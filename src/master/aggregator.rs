//! Master aggregator (component G): ingests worker events and full-state
//! syncs, and is the single writer for worker records, the merged session
//! map, and the event ring.

use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::worker::session::Session;
use crate::worker::{WorkerEvent, WorkerEventType};

use super::event_ring::EventRing;
use super::worker_record::WorkerRecord;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSyncBody {
    #[serde(default)]
    pub worker_id: Option<String>,
    pub sessions: Vec<Session>,
}

struct State {
    workers: HashMap<String, WorkerRecord>,
    sessions: HashMap<String, Session>,
    ring: EventRing,
}

pub struct MasterAggregator {
    state: RwLock<State>,
}

impl MasterAggregator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                workers: HashMap::new(),
                sessions: HashMap::new(),
                ring: EventRing::new(),
            }),
        }
    }

    pub async fn ingest_event(&self, event: WorkerEvent) {
        let mut state = self.state.write().await;

        match event.event_type {
            WorkerEventType::WorkerRegistered => {
                let entry = state.workers.entry(event.worker_id.clone()).or_insert_with(|| WorkerRecord {
                    id: event.worker_id.clone(),
                    last_heartbeat: None,
                    registered_at: event.timestamp,
                    session_count: 0,
                    host_info: None,
                });
                entry.last_heartbeat = Some(event.timestamp);
                if let Some(data) = &event.data {
                    if let Some(host_info) = data.get("hostInfo") {
                        entry.host_info = Some(host_info.clone());
                    }
                    if let Some(n) = data.get("sessionCount").and_then(Value::as_u64) {
                        entry.session_count = n;
                    }
                }
            }
            WorkerEventType::WorkerDeregistered => {
                if let Some(worker) = state.workers.get_mut(&event.worker_id) {
                    worker.last_heartbeat = None;
                }
            }
            WorkerEventType::Heartbeat => {
                let registered_at = event.timestamp;
                let entry = state.workers.entry(event.worker_id.clone()).or_insert_with(|| WorkerRecord {
                    id: event.worker_id.clone(),
                    last_heartbeat: None,
                    registered_at,
                    session_count: 0,
                    host_info: None,
                });
                entry.last_heartbeat = Some(event.timestamp);
                let data = event.data.clone().unwrap_or(Value::Null);
                entry.session_count = data.get("sessionCount").and_then(Value::as_u64).unwrap_or(0);
                if let Some(host_info) = data.get("hostInfo") {
                    entry.host_info = Some(host_info.clone());
                }
            }
            WorkerEventType::SessionCreated => {
                if let Some(name) = &event.session_name {
                    let key = format!("{}:{}", event.worker_id, name);
                    let mut session = Session::new(name.clone(), false, 0);
                    session.host = Some(event.worker_id.clone());
                    if let Some(data) = &event.data {
                        if let Some(p) = data.get("worktreePath").and_then(Value::as_str) {
                            session.worktree_path = Some(p.to_string());
                        }
                        if let Some(p) = data.get("projectName").and_then(Value::as_str) {
                            session.project_name = Some(p.to_string());
                        }
                        if let Some(p) = data.get("linearIssue").and_then(Value::as_str) {
                            session.linear_issue = Some(p.to_string());
                        }
                    }
                    state.sessions.insert(key, session);
                }
            }
            WorkerEventType::SessionKilled => {
                if let Some(name) = &event.session_name {
                    state.sessions.remove(&format!("{}:{}", event.worker_id, name));
                }
            }
            WorkerEventType::SessionAttached
            | WorkerEventType::SessionDetached
            | WorkerEventType::ClaudeStateChanged
            | WorkerEventType::GitChanges => {
                if let Some(name) = &event.session_name {
                    let key = format!("{}:{}", event.worker_id, name);
                    let session = state
                        .sessions
                        .entry(key)
                        .or_insert_with(|| {
                            let mut s = Session::new(name.clone(), false, 0);
                            s.host = Some(event.worker_id.clone());
                            s
                        });
                    merge_event_data(session, &event);
                }
            }
        }

        state.ring.push(event);
    }

    pub async fn sync(&self, body: WorkerSyncBody) {
        let worker_id = body.worker_id.unwrap_or_else(|| "unknown".to_string());
        let mut state = self.state.write().await;
        for mut incoming in body.sessions {
            let key = format!("{worker_id}:{}", incoming.session_name);
            incoming.host = Some(worker_id.clone());
            match state.sessions.get_mut(&key) {
                Some(existing) => shallow_merge_session(existing, incoming),
                None => {
                    state.sessions.insert(key, incoming);
                }
            }
        }
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        let state = self.state.read().await;
        state.workers.values().cloned().collect()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let state = self.state.read().await;
        state.sessions.values().cloned().collect()
    }

    pub async fn event_counts(&self) -> (usize, usize, usize) {
        let state = self.state.read().await;
        (state.workers.len(), state.sessions.len(), state.ring.len())
    }

    pub async fn events_page(&self, limit: usize, before: Option<chrono::DateTime<Utc>>) -> (Vec<WorkerEvent>, bool, usize) {
        let state = self.state.read().await;
        let (page, has_more, total) = state.ring.query(limit, before);
        (page.into_iter().cloned().collect(), has_more, total)
    }

    pub async fn recent_events(&self, n: usize) -> Vec<WorkerEvent> {
        let state = self.state.read().await;
        state.ring.recent(n).into_iter().cloned().collect()
    }
}

impl Default for MasterAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_event_data(session: &mut Session, event: &WorkerEvent) {
    session.attached = match event.event_type {
        WorkerEventType::SessionAttached => true,
        WorkerEventType::SessionDetached => false,
        _ => session.attached,
    };
    let Some(data) = &event.data else { return };
    if let Some(v) = data.get("claudeState").and_then(Value::as_str) {
        session.claude_state = Some(v.to_string());
    }
    if let Some(v) = data.get("claudeLastMessage").and_then(Value::as_str) {
        session.claude_last_message = Some(v.to_string());
    }
    if let Some(v) = data.get("gitStats") {
        session.git_stats = Some(v.clone());
    }
}

fn shallow_merge_session(existing: &mut Session, incoming: Session) {
    *existing = Session {
        session_name: existing.session_name.clone(),
        worktree_path: incoming.worktree_path.or_else(|| existing.worktree_path.clone()),
        project_name: incoming.project_name.or_else(|| existing.project_name.clone()),
        linear_issue: incoming.linear_issue.or_else(|| existing.linear_issue.clone()),
        created: existing.created,
        host: incoming.host.or_else(|| existing.host.clone()),
        attached: incoming.attached,
        windows: incoming.windows,
        title: incoming.title.or_else(|| existing.title.clone()),
        claude_state: incoming.claude_state.or_else(|| existing.claude_state.clone()),
        git_stats: incoming.git_stats.or_else(|| existing.git_stats.clone()),
        claude_last_message: incoming.claude_last_message.or_else(|| existing.claude_last_message.clone()),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn worker_registered_preserves_registered_at_on_reregister() {
        let agg = MasterAggregator::new();
        let first = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let mut e1 = WorkerEvent::new(WorkerEventType::WorkerRegistered, "w1");
        e1.timestamp = first;
        agg.ingest_event(e1).await;

        let second = chrono::DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z").unwrap().with_timezone(&Utc);
        let mut e2 = WorkerEvent::new(WorkerEventType::WorkerRegistered, "w1");
        e2.timestamp = second;
        agg.ingest_event(e2).await;

        let workers = agg.workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].registered_at, first);
        assert_eq!(workers[0].last_heartbeat, Some(second));
    }

    #[tokio::test]
    async fn deregister_retains_record_as_offline() {
        let agg = MasterAggregator::new();
        agg.ingest_event(WorkerEvent::new(WorkerEventType::WorkerRegistered, "w1")).await;
        agg.ingest_event(WorkerEvent::new(WorkerEventType::WorkerDeregistered, "w1")).await;

        let workers = agg.workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].last_heartbeat, None);
    }

    #[tokio::test]
    async fn session_created_then_killed_removes_entry() {
        let agg = MasterAggregator::new();
        agg.ingest_event(WorkerEvent::new(WorkerEventType::SessionCreated, "w1").with_session("foo")).await;
        assert_eq!(agg.sessions().await.len(), 1);

        agg.ingest_event(WorkerEvent::new(WorkerEventType::SessionKilled, "w1").with_session("foo")).await;
        assert_eq!(agg.sessions().await.len(), 0);
    }

    #[tokio::test]
    async fn git_changes_shallow_merges_into_existing_session() {
        let agg = MasterAggregator::new();
        agg.ingest_event(WorkerEvent::new(WorkerEventType::SessionCreated, "w1").with_session("foo")).await;
        agg.ingest_event(
            WorkerEvent::new(WorkerEventType::GitChanges, "w1")
                .with_session("foo")
                .with_data(json!({ "gitStats": { "ahead": 1 } })),
        )
        .await;

        let sessions = agg.sessions().await;
        assert_eq!(sessions[0].git_stats, Some(json!({ "ahead": 1 })));
    }

    #[tokio::test]
    async fn ring_grows_past_1000_evicts_oldest() {
        let agg = MasterAggregator::new();
        for _ in 0..1050 {
            agg.ingest_event(WorkerEvent::new(WorkerEventType::Heartbeat, "w1")).await;
        }
        let (_, _, events) = agg.event_counts().await;
        assert_eq!(events, 1000);
    }
}
