//! Append-only structured log of gate decisions.
//!
//! Writes one JSON line per decision to `{data_dir}/decisions.log` and
//! rotates to `decisions.log.1` at 50 MB. URLs are stored as SHA-256
//! fingerprints, never in clear — the decision log must not turn into
//! the history store the host explicitly does not keep.
//!
//! Fields are `camelCase` for easy `jq` querying:
//! ```sh
//! jq 'select(.verdict == "block")' ~/.local/share/tabgate/decisions.log
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use super::engine::Decision;
use super::url_fingerprint;
use crate::tabs::TabId;

/// Maximum log file size before rotation (50 MB).
const ROTATE_BYTES: u64 = 50 * 1024 * 1024;

/// One line of the decision log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEntry {
    /// RFC-3339 timestamp of the decision.
    pub timestamp: String,
    /// Tab that made the request.
    pub tab_id: String,
    /// Lowercase hex SHA-256 of the requested URL.
    pub url_fingerprint: String,
    /// Resource kind: `"document"` | `"script"` | `"cookie"` | …
    pub kind: String,
    /// `"allow"` | `"block"` | `"ask"`.
    pub verdict: String,
    /// `"block_listed"` | `"allow_listed"` | `"kind_default"`.
    pub rule: String,
    pub third_party: bool,
}

impl DecisionEntry {
    pub fn new(tab_id: TabId, url: &str, kind: &str, decision: &Decision) -> Self {
        use super::engine::DecisionReason;
        let rule = match &decision.reason {
            DecisionReason::BlockListed(_) => "block_listed",
            DecisionReason::AllowListed(_) => "allow_listed",
            DecisionReason::KindDefault => "kind_default",
        };
        Self {
            timestamp: Utc::now().to_rfc3339(),
            tab_id: tab_id.to_string(),
            url_fingerprint: url_fingerprint(url),
            kind: kind.to_string(),
            verdict: decision.verdict.as_str().to_string(),
            rule: rule.to_string(),
            third_party: decision.third_party,
        }
    }
}

/// Append-only JSONL decision log.
///
/// The file handle is opened lazily and cached for the process lifetime.
/// Write errors are logged at WARN and never propagated — a broken log
/// must not interrupt page loads.
pub struct DecisionLog {
    path: PathBuf,
    /// Cached, open file handle; `None` until the first write.
    file: Mutex<Option<tokio::fs::File>>,
}

impl DecisionLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("decisions.log"),
            file: Mutex::new(None),
        }
    }

    /// Append one entry.
    pub async fn append(&self, entry: &DecisionEntry) {
        if let Err(e) = self.try_append(entry).await {
            tracing::warn!(err = %e, "decision log write failed");
        }
    }

    async fn try_append(&self, entry: &DecisionEntry) -> Result<()> {
        let line = serde_json::to_string(entry)? + "\n";

        let mut guard = self.file.lock().await;

        // Rotation check: once the on-disk file passes 50 MB, drop the
        // handle and rename before opening fresh.
        if guard.is_some() {
            if let Ok(meta) = tokio::fs::metadata(&self.path).await {
                if meta.len() >= ROTATE_BYTES {
                    *guard = None;
                    let rotated = self.path.with_extension("log.1");
                    let _ = tokio::fs::rename(&self.path, &rotated).await;
                }
            }
        }

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        let file = guard.as_mut().expect("file opened above");
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Drain a bus subscription and persist every `policy.decision` event.
///
/// Runs until every sender is dropped. Spawn it alongside the serve
/// loop with a fresh `broadcaster.subscribe()`.
pub async fn run_decision_logger(
    mut rx: tokio::sync::broadcast::Receiver<crate::events::Notification>,
    log: std::sync::Arc<DecisionLog>,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match rx.recv().await {
            Ok(n) if n.event == "policy.decision" => {
                // The payload already has the entry shape — re-serialize
                // verbatim as one line.
                if let Ok(line) = serde_json::to_string(&n.payload) {
                    if let Err(e) = append_raw(&log, line).await {
                        tracing::warn!(err = %e, "decision log write failed");
                    }
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "decision logger lagged — entries dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn append_raw(log: &DecisionLog, line: String) -> Result<()> {
    let mut guard = log.file.lock().await;
    if guard.is_none() {
        if let Some(parent) = log.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)
            .await?;
        *guard = Some(file);
    }
    let file = guard.as_mut().expect("file opened above");
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
