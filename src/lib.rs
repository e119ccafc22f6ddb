pub mod config;
pub mod crash;
pub mod events;
pub mod governor;
pub mod modes;
pub mod policy;
pub mod session;
pub mod storage;
pub mod tabs;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::warn;

use config::HostConfig;
use crash::CrashReporter;
use events::EventBroadcaster;
use governor::TabGovernor;
use modes::ModeManager;
use policy::decision_log::DecisionLog;
use policy::PolicyEngine;
use session::SessionManager;
use storage::Storage;
use tabs::{EdgeMode, TabRegistry, TabSupervisor};

/// Shared host state passed to the serve loop, the CLI handlers, and
/// embedders.
#[derive(Clone)]
pub struct HostContext {
    pub config: Arc<HostConfig>,
    pub storage: Arc<Storage>,
    pub bus: EventBroadcaster,
    pub engine: Arc<PolicyEngine>,
    pub registry: Arc<RwLock<TabRegistry>>,
    pub session_manager: Arc<SessionManager>,
    pub reporter: Arc<CrashReporter>,
    pub supervisor: Arc<TabSupervisor>,
    pub governor: Arc<TabGovernor>,
    pub modes: Arc<RwLock<ModeManager>>,
    pub decision_log: Arc<DecisionLog>,
    pub started_at: std::time::Instant,
}

impl HostContext {
    /// Wire every component together. Creates the data dir and opens
    /// the database; does not restore a session or start any loop —
    /// that is the serve path's job.
    pub async fn init(config: HostConfig) -> Result<Self> {
        let config = Arc::new(config);
        let bus = EventBroadcaster::new();

        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let engine = Arc::new(PolicyEngine::open(
            &config.data_dir,
            config.gate.to_policy(),
        ));

        let edge_mode = config.tabs.edge_mode.parse::<EdgeMode>().unwrap_or_else(|e| {
            warn!(err = %e, "invalid [tabs].edge_mode — using block");
            EdgeMode::Block
        });
        let registry = Arc::new(RwLock::new(TabRegistry::new(
            engine.clone(),
            bus.clone(),
            edge_mode,
            config.tabs.max_tabs,
        )));

        let session_manager = Arc::new(SessionManager::new(
            storage.clone(),
            registry.clone(),
            bus.clone(),
            config.session.clone(),
        ));
        let reporter = Arc::new(CrashReporter::new(storage.clone(), bus.clone()));
        let supervisor = Arc::new(TabSupervisor::new(registry.clone(), reporter.clone()));
        let governor = Arc::new(TabGovernor::new(config.resources.clone(), storage.clone()));
        let modes = Arc::new(RwLock::new(ModeManager::new(bus.clone())));
        let decision_log = Arc::new(DecisionLog::new(&config.data_dir));

        Ok(Self {
            config,
            storage,
            bus,
            engine,
            registry,
            session_manager,
            reporter,
            supervisor,
            governor,
            modes,
            decision_log,
            started_at: std::time::Instant::now(),
        })
    }

    // ── Policy list edits ─────────────────────────────────────────────
    //
    // Go through these rather than the engine directly so subscribers
    // (UI badges, the decision logger) hear about list changes.

    pub fn allow_host(&self, pattern: &str) -> Result<(), policy::PatternError> {
        let p = self.engine.allow_host(pattern)?;
        self.publish_list_change("allow", "add", &p.to_string());
        Ok(())
    }

    pub fn block_host(&self, pattern: &str) -> Result<(), policy::PatternError> {
        let p = self.engine.block_host(pattern)?;
        self.publish_list_change("block", "add", &p.to_string());
        Ok(())
    }

    pub fn remove_host(&self, pattern: &str) -> Result<bool, policy::PatternError> {
        let removed = self.engine.remove_host(pattern)?;
        if removed {
            self.publish_list_change("both", "remove", pattern);
        }
        Ok(removed)
    }

    fn publish_list_change(&self, list: &str, op: &str, pattern: &str) {
        self.bus.publish(
            "policy.listChanged",
            serde_json::json!({ "list": list, "op": op, "pattern": pattern }),
        );
    }
}
