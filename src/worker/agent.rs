//! Worker agent (component F): polls the local multiplexer, diffs against
//! the last snapshot, and pushes the resulting events upstream with a
//! durable retry queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sysinfo::System;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::repo::RepoReader;

use super::event::{WorkerEvent, WorkerEventType};
use super::session::{Session, SessionMap};
use super::store::WorkerStateStore;
use super::tmux::Multiplexer;

pub struct WorkerAgent {
    config: WorkerConfig,
    store: WorkerStateStore,
    multiplexer: Arc<dyn Multiplexer>,
    http: reqwest::Client,
    shutdown: Notify,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig, store: WorkerStateStore, multiplexer: Arc<dyn Multiplexer>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("building worker http client");
        Self { config, store, multiplexer, http, shutdown: Notify::new() }
    }

    /// Runs until `stop()` is called. Two independent, non-overlapping
    /// timers: poll (default 10s) and heartbeat (default 30s). Re-entrancy
    /// within a timer is prevented by awaiting each tick to completion
    /// before the next fires — `tokio::time::interval` ticks queue rather
    /// than overlap.
    pub async fn run(&self) {
        self.register().await;

        let mut poll_timer = interval(Duration::from_secs(self.config.poll_interval_secs));
        let mut heartbeat_timer = interval(Duration::from_secs(self.config.heartbeat_interval_secs));

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    if let Err(e) = self.poll_tick().await {
                        warn!(err = %e, "poll tick failed");
                    }
                    self.drain_queue().await;
                }
                _ = heartbeat_timer.tick() => {
                    if let Err(e) = self.heartbeat_tick().await {
                        warn!(err = %e, "heartbeat tick failed");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("worker agent shutting down");
                    self.deregister().await;
                    return;
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    async fn poll_tick(&self) -> anyhow::Result<()> {
        let raw = self.multiplexer.list_sessions().await?;
        let previous = self.store.previous_sessions().await;

        let mut current = SessionMap::new();
        let mut seen = HashSet::new();

        for r in raw {
            seen.insert(r.session_name.clone());
            let pane = self.multiplexer.pane_info(&r.session_name).await;
            let claude_state = pane.current_command.as_deref().map(|cmd| {
                if cmd.contains("claude") { "active".to_string() } else { "idle".to_string() }
            });
            let git_stats = match &pane.cwd {
                Some(cwd) => RepoReader::status(cwd).await.ok().and_then(|s| serde_json::to_value(s).ok()),
                None => None,
            };

            let mut session = previous.get(&r.session_name).cloned().unwrap_or_else(|| {
                Session::new(r.session_name.clone(), r.attached, r.windows)
            });
            session.attached = r.attached;
            session.windows = r.windows;
            session.worktree_path = pane.cwd.or(session.worktree_path);
            session.claude_state = claude_state.or(session.claude_state);
            session.git_stats = git_stats.or(session.git_stats);

            self.diff_and_emit(&previous, &session).await;
            current.insert(r.session_name, session);
        }

        for (name, _) in previous.iter().filter(|(n, _)| !seen.contains(*n)) {
            self.push_event(WorkerEvent::new(WorkerEventType::SessionKilled, &self.config.worker_id).with_session(name))
                .await;
        }

        self.store.replace_sessions(current).await?;
        Ok(())
    }

    async fn diff_and_emit(&self, previous: &SessionMap, current: &Session) {
        match previous.get(&current.session_name) {
            None => {
                self.push_event(
                    WorkerEvent::new(WorkerEventType::SessionCreated, &self.config.worker_id)
                        .with_session(&current.session_name)
                        .with_data(json!({
                            "worktreePath": current.worktree_path,
                            "projectName": current.project_name,
                            "linearIssue": current.linear_issue,
                        })),
                )
                .await;
            }
            Some(prev) => {
                if prev.attached != current.attached {
                    let event_type = if current.attached { WorkerEventType::SessionAttached } else { WorkerEventType::SessionDetached };
                    self.push_event(WorkerEvent::new(event_type, &self.config.worker_id).with_session(&current.session_name)).await;
                }
                if prev.claude_state != current.claude_state {
                    self.push_event(
                        WorkerEvent::new(WorkerEventType::ClaudeStateChanged, &self.config.worker_id)
                            .with_session(&current.session_name)
                            .with_data(json!({
                                "claudeState": current.claude_state,
                                "claudeLastMessage": current.claude_last_message,
                            })),
                    )
                    .await;
                }
                if prev.git_stats != current.git_stats {
                    self.push_event(
                        WorkerEvent::new(WorkerEventType::GitChanges, &self.config.worker_id)
                            .with_session(&current.session_name)
                            .with_data(json!({ "gitStats": current.git_stats })),
                    )
                    .await;
                }
            }
        }
    }

    async fn heartbeat_tick(&self) -> anyhow::Result<()> {
        self.store.touch_heartbeat().await?;
        let session_count = self.store.previous_sessions().await.len();
        self.push_event(
            WorkerEvent::new(WorkerEventType::Heartbeat, &self.config.worker_id)
                .with_data(json!({ "sessionCount": session_count, "hostInfo": host_info() })),
        )
        .await;
        Ok(())
    }

    /// Announce this worker to the master before the first poll/heartbeat
    /// tick. The master also upserts a worker record lazily on first
    /// `heartbeat`, but an explicit `worker_registered` carries a cleaner
    /// `registeredAt` (see §4.G) and is what a fresh worker emits on boot.
    async fn register(&self) {
        let session_count = self.store.previous_sessions().await.len();
        self.push_event(
            WorkerEvent::new(WorkerEventType::WorkerRegistered, &self.config.worker_id)
                .with_data(json!({ "sessionCount": session_count, "hostInfo": host_info() })),
        )
        .await;
    }

    async fn deregister(&self) {
        self.push_event(WorkerEvent::new(WorkerEventType::WorkerDeregistered, &self.config.worker_id)).await;
    }

    /// Queue the event durably, then attempt an immediate send; on success
    /// drop it, on failure leave it queued for the next drain. Queuing
    /// happens before the network attempt so a crash mid-send still
    /// replays the event — the master treats all worker events as
    /// idempotent on replay.
    async fn push_event(&self, event: WorkerEvent) {
        if let Err(e) = self.store.enqueue_event(event.clone()).await {
            warn!(err = %e, "failed to persist event to local queue");
            return;
        }
        self.try_send_head().await;
    }

    /// Drain the queue head-first, stopping at the first failure to
    /// preserve FIFO ordering.
    async fn drain_queue(&self) {
        while self.store.queue_len().await > 0 {
            if !self.try_send_head().await {
                break;
            }
        }
    }

    /// Attempt to send whatever is currently at the head of the queue. If
    /// it sends successfully, dequeue it and report `true`; otherwise
    /// leave it in place and report `false`.
    async fn try_send_head(&self) -> bool {
        let Some(master_url) = &self.config.master_url else { return false };

        let Some(event) = self.store.peek_head().await else { return false };
        let url = format!("{}/api/worker-events", master_url.trim_end_matches('/'));

        match self.http.post(&url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {
                let _ = self.store.dequeue_event().await;
                debug!(event_type = ?event.event_type, "pushed worker event");
                true
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "worker event push rejected, left queued");
                false
            }
            Err(e) => {
                debug!(err = %e, "worker event push failed, left queued");
                false
            }
        }
    }
}


fn host_info() -> serde_json::Value {
    let mut sys = System::new();
    sys.refresh_memory();
    json!({
        "hostname": System::host_name(),
        "os": System::long_os_version(),
        "uptime": System::uptime(),
        "ramUsage": if sys.total_memory() > 0 {
            Some(sys.used_memory() as f64 / sys.total_memory() as f64)
        } else {
            None
        },
        "arch": System::cpu_arch(),
        "cpuCount": sys.cpus().len(),
    })
}
