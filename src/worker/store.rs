//! Worker state store (component E).
//!
//! Persists `{workerId, sessions, lastHeartbeat, eventQueue}` to a single
//! JSON file. Every mutation writes the full snapshot back to disk before
//! returning — the worker's session count is small enough that this is
//! cheap, and it keeps the contract simple: what's on disk is always
//! exactly what the last successful call produced.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use super::event::WorkerEvent;
use super::session::{Session, SessionMap};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreFile {
    worker_id: String,
    sessions: SessionMap,
    last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    event_queue: VecDeque<WorkerEvent>,
}

pub struct WorkerStateStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl WorkerStateStore {
    /// Load `{data_dir}/worker_state.json`, creating a fresh empty state if
    /// absent or unparseable (a corrupt file is replaced, not fatal).
    pub fn load(data_dir: &Path, worker_id: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating worker data dir")?;
        let path = data_dir.join("worker_state.json");

        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StoreFile>(&contents) {
                Ok(mut f) => {
                    f.worker_id = worker_id.to_string();
                    f
                }
                Err(e) => {
                    warn!(err = %e, path = %path.display(), "worker state file corrupt — starting fresh");
                    StoreFile { worker_id: worker_id.to_string(), ..Default::default() }
                }
            },
            Err(_) => StoreFile { worker_id: worker_id.to_string(), ..Default::default() },
        };

        let store = Self { path, state: Mutex::new(state) };
        // Nothing else holds the lock yet — try_lock cannot contend here,
        // and blocking_lock() would panic if called from async context.
        store.persist_sync(&store.state.try_lock().expect("uncontended at construction"))?;
        Ok(store)
    }

    pub async fn previous_sessions(&self) -> SessionMap {
        self.state.lock().await.sessions.clone()
    }

    pub async fn replace_sessions(&self, sessions: SessionMap) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sessions = sessions;
        self.persist_sync(&state)
    }

    pub async fn touch_heartbeat(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.last_heartbeat = Some(chrono::Utc::now());
        self.persist_sync(&state)
    }

    pub async fn enqueue_event(&self, event: WorkerEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        state.event_queue.push_back(event);
        self.persist_sync(&state)
    }

    /// Return a clone of the queue head without removing it.
    pub async fn peek_head(&self) -> Option<WorkerEvent> {
        self.state.lock().await.event_queue.front().cloned()
    }

    /// Remove and return the head of the queue, FIFO.
    pub async fn dequeue_event(&self) -> Result<Option<WorkerEvent>> {
        let mut state = self.state.lock().await;
        let event = state.event_queue.pop_front();
        if event.is_some() {
            self.persist_sync(&state)?;
        }
        Ok(event)
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.event_queue.len()
    }

    /// Write-to-temp-then-rename on the same filesystem — the file is never
    /// observed half-written by a concurrent reader.
    fn persist_sync(&self, state: &StoreFile) -> Result<()> {
        let dir = self.path.parent().context("store path has no parent")?;
        let json = serde_json::to_vec_pretty(state)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path).context("renaming worker state file into place")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::session::Session;

    #[tokio::test]
    async fn corrupt_file_is_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("worker_state.json"), b"not json").unwrap();
        let store = WorkerStateStore::load(dir.path(), "w1").unwrap();
        assert!(store.previous_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn round_trips_sessions_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkerStateStore::load(dir.path(), "w1").unwrap();
        let mut sessions = SessionMap::new();
        sessions.insert("foo".into(), Session::new("foo".into(), true, 1));
        store.replace_sessions(sessions).await.unwrap();

        let reloaded = WorkerStateStore::load(dir.path(), "w1").unwrap();
        let got = reloaded.previous_sessions().await;
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("foo"));
    }

    #[tokio::test]
    async fn event_queue_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkerStateStore::load(dir.path(), "w1").unwrap();
        store
            .enqueue_event(WorkerEvent::new(super::super::event::WorkerEventType::Heartbeat, "w1"))
            .await
            .unwrap();
        store
            .enqueue_event(WorkerEvent::new(super::super::event::WorkerEventType::SessionKilled, "w1").with_session("a"))
            .await
            .unwrap();

        let first = store.dequeue_event().await.unwrap().unwrap();
        assert_eq!(first.event_type, super::super::event::WorkerEventType::Heartbeat);
        let second = store.dequeue_event().await.unwrap().unwrap();
        assert_eq!(second.session_name.as_deref(), Some("a"));
        assert!(store.dequeue_event().await.unwrap().is_none());
    }
}
