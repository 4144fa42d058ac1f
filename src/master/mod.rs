//! Master process: aggregates worker events and serves the API surface.

pub mod aggregator;
pub mod event_ring;
pub mod worker_record;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use aggregator::{MasterAggregator, WorkerSyncBody};
pub use worker_record::{derive_worker_status, WorkerRecord, WorkerStatus};

use crate::auth::TokenStore;
use crate::config::MasterConfig;
use crate::events::EventBus;
use crate::policy::RuleEngine;
use crate::session::SessionManager;

/// Composition root for the master binary: the process-wide singletons
/// every API handler and background task needs a handle to.
pub struct MasterContext {
    pub config: MasterConfig,
    pub aggregator: MasterAggregator,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
    pub rule_engine: Arc<RwLock<RuleEngine>>,
    pub tokens: TokenStore,
}

impl MasterContext {
    pub fn new(config: MasterConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let rule_engine = Arc::new(RwLock::new(RuleEngine::new(config.tool_approval_rules.clone())));
        let sessions = Arc::new(SessionManager::new(rule_engine.clone(), bus.clone()));
        let tokens = TokenStore::new(config.data_dir.clone());

        Arc::new(Self {
            config,
            aggregator: MasterAggregator::new(),
            sessions,
            bus,
            rule_engine,
            tokens,
        })
    }
}
