use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::policy::{GatePolicy, Verdict};

const DEFAULT_AUTOSAVE_SECS: u64 = 30;
const DEFAULT_KEEP_SNAPSHOTS: u32 = 10;
const DEFAULT_PRUNE_DAYS: u32 = 30;

// ─── GateConfig ───────────────────────────────────────────────────────────────

/// Resource-gate defaults (`[gate]` in config.toml).
///
/// These apply only when neither the allow nor the block list matches.
/// Shipped defaults are private-by-default: third-party cookies are
/// blocked and third-party scripts ask.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// Verdict for first-party requests. Default: allow.
    pub first_party_default: Verdict,
    /// Verdict for third-party requests of unlisted kinds. Default: allow.
    pub third_party_default: Verdict,
    /// Verdict for third-party cookies. Default: block.
    pub third_party_cookies: Verdict,
    /// Verdict for third-party scripts. Default: ask.
    pub third_party_scripts: Verdict,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            first_party_default: Verdict::Allow,
            third_party_default: Verdict::Allow,
            third_party_cookies: Verdict::Block,
            third_party_scripts: Verdict::Ask,
        }
    }
}

impl GateConfig {
    pub fn to_policy(&self) -> GatePolicy {
        GatePolicy {
            first_party_default: self.first_party_default,
            third_party_default: self.third_party_default,
            third_party_cookies: self.third_party_cookies,
            third_party_scripts: self.third_party_scripts,
        }
    }
}

// ─── SessionConfig ────────────────────────────────────────────────────────────

/// Session persistence configuration (`[session]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between automatic snapshots. Default: 30.
    pub autosave_secs: u64,
    /// How many autosave snapshots to keep. Default: 10.
    pub keep_snapshots: u32,
    /// How many days of crash reports to keep before pruning
    /// (0 = never prune). Default: 30.
    pub prune_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_secs: DEFAULT_AUTOSAVE_SECS,
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
            prune_days: DEFAULT_PRUNE_DAYS,
        }
    }
}

// ─── ResourceConfig ───────────────────────────────────────────────────────────

/// Tab governor configuration (`[resources]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// System RAM percentage at which background tabs start getting
    /// suspended (10-95). Default: 70.
    pub max_memory_percent: u8,
    /// Emergency threshold: above this %, all background tabs are
    /// suspended. Default: 90.
    pub emergency_memory_percent: u8,
    /// Polling interval in seconds. Default: 5.
    pub poll_interval_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_memory_percent: 70,
            emergency_memory_percent: 90,
            poll_interval_secs: 5,
        }
    }
}

// ─── TabsConfig ───────────────────────────────────────────────────────────────

/// Tab strip behavior (`[tabs]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TabsConfig {
    /// What next/prev focus does at the strip edges: "block" | "wrap".
    /// Default: "block".
    pub edge_mode: String,
    /// Maximum open tabs; 0 = unlimited. Default: 0.
    pub max_tabs: usize,
}

impl Default for TabsConfig {
    fn default() -> Self {
        Self {
            edge_mode: "block".to_string(),
            max_tabs: 0,
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,tabgate=trace"
    /// (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json"
    /// (structured for log aggregators).
    log_format: Option<String>,
    /// Resource-gate defaults (`[gate]`).
    gate: Option<GateConfig>,
    /// Session persistence (`[session]`).
    session: Option<SessionConfig>,
    /// Tab governor (`[resources]`).
    resources: Option<ResourceConfig>,
    /// Tab strip behavior (`[tabs]`).
    tabs: Option<TabsConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── HostConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" | "json".
    pub log_format: String,
    pub gate: GateConfig,
    pub session: SessionConfig,
    pub resources: ResourceConfig,
    pub tabs: TabsConfig,
}

impl HostConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>, log_format: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // TOML is the lowest-priority override layer.
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let log_format = log_format
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        Self {
            data_dir,
            log,
            log_format,
            gate: toml.gate.unwrap_or_default(),
            session: toml.session.unwrap_or_default(),
            resources: toml.resources.unwrap_or_default(),
            tabs: toml.tabs.unwrap_or_default(),
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting
/// the host.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub autosave_secs: u64,
    pub prune_days: u32,
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// The watcher uses the `notify` crate (kqueue on macOS, inotify on
/// Linux) to detect file modifications. Gate defaults, governor
/// thresholds, and the data dir require a restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal;
    /// the host runs fine without hot-reload).
    pub fn start(data_dir: &Path) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.autosave_secs != new_config.autosave_secs
                                || guard.prune_days != new_config.prune_days
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    autosave_secs = new_config.autosave_secs,
                                    prune_days = new_config.prune_days,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the data_dir (parent of config.toml) since
                // watching a non-existent file fails on some platforms.
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

/// Load only the hot-reloadable fields from config.toml.
fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    let session = toml.session.unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        autosave_secs: session.autosave_secs,
        prune_days: session.prune_days,
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/tabgate
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tabgate");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/tabgate or ~/.local/share/tabgate
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("tabgate");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("tabgate");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\tabgate
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tabgate");
        }
    }
    // Fallback
    PathBuf::from(".tabgate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_private_by_default() {
        let gate = GateConfig::default();
        assert_eq!(gate.third_party_cookies, Verdict::Block);
        assert_eq!(gate.third_party_scripts, Verdict::Ask);
        assert_eq!(gate.first_party_default, Verdict::Allow);
    }

    #[test]
    fn toml_overrides_gate_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
log = "debug"

[gate]
third_party_scripts = "block"

[session]
autosave_secs = 5
"#,
        )
        .unwrap();

        let cfg = HostConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.gate.third_party_scripts, Verdict::Block);
        // Unset fields keep their defaults.
        assert_eq!(cfg.gate.third_party_cookies, Verdict::Block);
        assert_eq!(cfg.session.autosave_secs, 5);
        assert_eq!(cfg.session.keep_snapshots, DEFAULT_KEEP_SNAPSHOTS);
    }

    #[test]
    fn cli_beats_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "log = \"debug\"\n").unwrap();
        let cfg = HostConfig::new(
            Some(dir.path().to_path_buf()),
            Some("trace".to_string()),
            None,
        );
        assert_eq!(cfg.log, "trace");
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not [valid toml").unwrap();
        let cfg = HostConfig::new(Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.tabs.edge_mode, "block");
    }
}
