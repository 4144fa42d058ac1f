//! Master's view of a registered worker and its derived liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Stale,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: String,
    /// `None` encodes the spec's "empty string ⇒ explicitly offline".
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub session_count: u64,
    pub host_info: Option<Value>,
}

impl WorkerRecord {
    pub fn status_at(&self, now: DateTime<Utc>) -> WorkerStatus {
        derive_worker_status(now, self.last_heartbeat)
    }
}

/// Pure function of `now` and `last_heartbeat`. A `None` heartbeat is
/// "explicitly offline" (deregistered or never seen). Ages are clamped
/// only at the reporting boundary, never internally — a negative age
/// (future timestamp, clock skew) reads as `online`, never clamped to 0.
pub fn derive_worker_status(now: DateTime<Utc>, last_heartbeat: Option<DateTime<Utc>>) -> WorkerStatus {
    let Some(last_heartbeat) = last_heartbeat else {
        return WorkerStatus::Offline;
    };
    let age = (now - last_heartbeat).num_milliseconds();
    if age < 60_000 {
        WorkerStatus::Online
    } else if age < 120_000 {
        WorkerStatus::Stale
    } else {
        WorkerStatus::Offline
    }
}
