//! `session` — saving and restoring the set of open tabs.
//!
//! A snapshot is the ordered tab strip (url, title, state-at-save) plus
//! the focus index. Restore is always lazy: every tab comes back
//! `Dormant` and loads only when focused. The `session.lock` marker
//! tells the next startup whether the previous run shut down cleanly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::events::EventBroadcaster;
use crate::storage::{SessionRow, Storage, TabSnapshotRow};
use crate::tabs::TabRegistry;

/// Name used for automatic snapshots.
pub const AUTOSAVE: &str = "autosave";

// ─── Crash marker ─────────────────────────────────────────────────────────────

/// `{data_dir}/session.lock` — written with our PID on startup, removed
/// on clean shutdown. Finding one at startup means the previous run
/// died mid-flight and the last autosave is a crash-recovery candidate.
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Write the marker. Returns the lock and whether a stale marker
    /// from a dead run was found.
    pub fn acquire(data_dir: &Path) -> Result<(Self, bool)> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("session.lock");
        let stale = match std::fs::read_to_string(&path) {
            Ok(pid) => {
                warn!(
                    pid = %pid.trim(),
                    "stale session.lock found — previous run did not shut down cleanly"
                );
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(err = %e, "session.lock unreadable — treating as stale");
                true
            }
        };
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .context("failed to write session.lock")?;
        Ok((Self { path }, stale))
    }

    /// Clean shutdown: remove the marker.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(err = %e, "failed to remove session.lock");
        }
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct SessionManager {
    storage: Arc<Storage>,
    registry: Arc<RwLock<TabRegistry>>,
    bus: EventBroadcaster,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<RwLock<TabRegistry>>,
        bus: EventBroadcaster,
        config: SessionConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            bus,
            config,
        }
    }

    /// Snapshot the registry under `name`.
    pub async fn save(&self, name: &str, kind: &str) -> Result<SessionRow> {
        let (tabs, focused) = {
            let reg = self.registry.read().await;
            let tabs: Vec<TabSnapshotRow> = reg
                .tabs()
                .iter()
                .map(|t| {
                    (
                        t.url.as_ref().map(|u| u.to_string()),
                        t.title.clone(),
                        t.state.as_str().to_string(),
                    )
                })
                .collect();
            (tabs, reg.focused_index())
        };
        let row = self.storage.save_session(name, kind, focused, &tabs).await?;
        debug!(session = %row.id, name, tabs = row.tab_count, "session saved");
        self.bus.publish(
            "session.saved",
            serde_json::json!({ "id": row.id, "name": name, "tabs": row.tab_count }),
        );
        Ok(row)
    }

    /// One autosave cycle: snapshot plus prune to the keep-count.
    pub async fn autosave(&self) -> Result<()> {
        if self.registry.read().await.is_empty() {
            // Nothing open — an empty autosave would clobber the last
            // useful snapshot on the next restore.
            return Ok(());
        }
        self.save(AUTOSAVE, "autosave").await?;
        let pruned = self
            .storage
            .prune_autosaves(self.config.keep_snapshots)
            .await?;
        if pruned > 0 {
            debug!(pruned, "old autosaves pruned");
        }
        Ok(())
    }

    /// Restore the most recent snapshot, if any. Every restored tab is
    /// `Dormant`; the remembered focus is kept but nothing loads until
    /// an explicit focus.
    pub async fn restore_latest(&self) -> Result<Option<SessionRow>> {
        match self.storage.latest_session().await? {
            Some(row) => {
                self.restore_row(&row).await?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Restore a named snapshot.
    pub async fn restore_named(&self, name: &str) -> Result<Option<SessionRow>> {
        match self.storage.get_session_named(name).await? {
            Some(row) => {
                self.restore_row(&row).await?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    async fn restore_row(&self, row: &SessionRow) -> Result<()> {
        let tab_rows = self.storage.session_tabs(&row.id).await?;
        let mut tabs = Vec::with_capacity(tab_rows.len());
        for t in tab_rows {
            let url = match t.url.as_deref() {
                Some(s) => match Url::parse(s) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        warn!(url = %s, err = %e, "skipping unparseable URL in saved session");
                        None
                    }
                },
                None => None,
            };
            tabs.push((url, t.title));
        }
        let focused = usize::try_from(row.focused_index).ok();
        {
            let mut reg = self.registry.write().await;
            reg.restore_tabs(tabs, focused);
        }
        info!(session = %row.id, name = %row.name, tabs = row.tab_count, "session restored");
        self.bus.publish(
            "session.restored",
            serde_json::json!({ "id": row.id, "name": row.name, "tabs": row.tab_count }),
        );
        Ok(())
    }

    pub fn autosave_interval_secs(&self) -> u64 {
        self.config.autosave_secs
    }
}

/// Run the autosave loop.
/// This is a long-running Tokio task — spawn with `tokio::spawn`.
///
/// When a [`ConfigWatcher`](crate::config::ConfigWatcher) is running,
/// pass its hot state so interval changes apply without a restart.
pub async fn run_autosave_loop(
    manager: Arc<SessionManager>,
    hot: Option<Arc<RwLock<crate::config::HotConfig>>>,
) {
    loop {
        let secs = match &hot {
            Some(h) => h.read().await.autosave_secs,
            None => manager.autosave_interval_secs(),
        };
        tokio::time::sleep(std::time::Duration::from_secs(secs.max(1))).await;
        if let Err(e) = manager.autosave().await {
            warn!(err = %e, "autosave failed");
        }
    }
}
