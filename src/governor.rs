//! Tab governor — monitors system RAM and suspends background tabs
//! under memory pressure.
//!
//! Runs a background Tokio task that polls system memory every
//! `poll_interval_secs` seconds, classifies the pressure level, and
//! suspends least-recently-focused loaded background tabs as needed.
//! The focused tab is never suspended.

use std::sync::Arc;

use sysinfo::System;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{config::ResourceConfig, storage::Storage, tabs::TabRegistry, tabs::TabState};

/// Memory pressure level computed from current system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below the configured budget — all normal.
    Normal,
    /// Within 5% of the budget — start suspending, one tab per tick.
    Warning,
    /// Budget exceeded — suspend half the background tabs.
    Critical,
    /// Above the emergency threshold — suspend every background tab.
    Emergency,
}

/// Core pressure-management engine.
pub struct TabGovernor {
    config: ResourceConfig,
    sys: Mutex<System>,
    storage: Arc<Storage>,
}

impl TabGovernor {
    pub fn new(config: ResourceConfig, storage: Arc<Storage>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        info!(
            max_memory_percent = config.max_memory_percent,
            emergency_memory_percent = config.emergency_memory_percent,
            "tab governor initialized"
        );
        Self {
            config,
            sys: Mutex::new(sys),
            storage,
        }
    }

    /// Refresh memory stats and return current usage percentage.
    pub async fn poll(&self) -> f64 {
        let mut sys = self.sys.lock().await;
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = sys.used_memory();
        if total == 0 {
            return 0.0;
        }
        (used as f64 / total as f64) * 100.0
    }

    /// Determine pressure level from current memory usage.
    pub async fn check_pressure(&self) -> PressureLevel {
        let usage_pct = self.poll().await;
        Self::classify(&self.config, usage_pct)
    }

    /// Pure classification, separated out for tests.
    pub fn classify(config: &ResourceConfig, usage_pct: f64) -> PressureLevel {
        let budget = config.max_memory_percent as f64;
        let emergency = config.emergency_memory_percent as f64;
        if usage_pct >= emergency {
            PressureLevel::Emergency
        } else if usage_pct >= budget {
            PressureLevel::Critical
        } else if usage_pct >= budget * 0.95 {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// How many of `candidates` background tabs this level evicts.
    pub fn suspend_quota(level: PressureLevel, candidates: usize) -> usize {
        match level {
            PressureLevel::Normal => 0,
            PressureLevel::Warning => candidates.min(1),
            PressureLevel::Critical => candidates.div_ceil(2),
            PressureLevel::Emergency => candidates,
        }
    }

    /// Write current tab-tier counts and RAM stats to SQLite.
    pub async fn record_metrics(
        &self,
        loaded: i64,
        dormant: i64,
        suspended: i64,
    ) -> anyhow::Result<()> {
        let sys = self.sys.lock().await;
        let total_ram = sys.total_memory() as i64;
        let used_ram = sys.used_memory() as i64;
        drop(sys);

        self.storage
            .record_pressure_metrics(total_ram, used_ram, loaded, dormant, suspended)
            .await
    }
}

/// Run the governor polling loop.
/// This is a long-running Tokio task — spawn with `tokio::spawn`.
pub async fn run_governor_loop(
    governor: Arc<TabGovernor>,
    registry: Arc<RwLock<TabRegistry>>,
    bus: crate::events::EventBroadcaster,
) {
    use tokio::time::{interval, Duration};

    let normal_interval = Duration::from_secs(governor.config.poll_interval_secs.max(1));
    let fast_interval = Duration::from_secs(1);
    let mut tick = interval(normal_interval);
    let mut last_pressure = PressureLevel::Normal;
    let mut use_fast = false;

    loop {
        tick.tick().await;

        let pressure = governor.check_pressure().await;

        if pressure != last_pressure {
            match pressure {
                PressureLevel::Normal => debug!("memory pressure: normal"),
                PressureLevel::Warning => {
                    warn!("memory pressure: warning — suspending cold background tabs")
                }
                PressureLevel::Critical => {
                    warn!("memory pressure: critical — suspending background tabs")
                }
                PressureLevel::Emergency => {
                    warn!("memory pressure: EMERGENCY — suspending all background tabs")
                }
            }
            bus.publish(
                "governor.pressureChanged",
                serde_json::json!({ "level": format!("{pressure:?}").to_lowercase() }),
            );
            last_pressure = pressure;
        }

        suspend_for_pressure(&governor, &registry, pressure).await;

        // Fast polling while under pressure (recreate interval only on
        // transition).
        let should_fast = pressure >= PressureLevel::Warning;
        if should_fast != use_fast {
            use_fast = should_fast;
            tick = if use_fast {
                interval(fast_interval)
            } else {
                interval(normal_interval)
            };
        }

        let (loaded, dormant, suspended) = count_tab_tiers(&registry).await;
        let _ = governor.record_metrics(loaded, dormant, suspended).await;
    }
}

/// Apply one tick's worth of suspension for the given pressure level.
pub async fn suspend_for_pressure(
    governor: &TabGovernor,
    registry: &RwLock<TabRegistry>,
    pressure: PressureLevel,
) -> usize {
    if pressure < PressureLevel::Warning {
        return 0;
    }
    let candidates = registry.read().await.suspend_candidates();
    let quota = TabGovernor::suspend_quota(pressure, candidates.len());
    let mut suspended = 0;
    if quota > 0 {
        let mut reg = registry.write().await;
        for id in candidates.into_iter().take(quota) {
            match reg.suspend(id) {
                Ok(()) => suspended += 1,
                Err(e) => debug!(tab = %id, err = %e, "suspend skipped"),
            }
        }
    }
    suspended
}

async fn count_tab_tiers(registry: &RwLock<TabRegistry>) -> (i64, i64, i64) {
    let reg = registry.read().await;
    let mut loaded = 0;
    let mut dormant = 0;
    let mut suspended = 0;
    for tab in reg.tabs() {
        match tab.state {
            TabState::Loaded | TabState::Loading => loaded += 1,
            TabState::Dormant => dormant += 1,
            TabState::Suspended => suspended += 1,
            TabState::Crashed => {}
        }
    }
    (loaded, dormant, suspended)
}
