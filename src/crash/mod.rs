//! `crash` — crash reports and known-issue triage.
//!
//! Crash reports carry a URL fingerprint and a reason, never the page
//! itself. Known issues are upstream defects the host is aware of but
//! cannot fix; they live in a small table so `doctor` can surface them
//! next to a crash instead of sending the user hunting.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

use crate::events::EventBroadcaster;
use crate::policy::url_fingerprint;
use crate::storage::Storage;

/// Records crash reports; shared by the tab supervisor and the startup
/// recovery path.
pub struct CrashReporter {
    storage: Arc<Storage>,
    bus: EventBroadcaster,
}

impl CrashReporter {
    pub fn new(storage: Arc<Storage>, bus: EventBroadcaster) -> Self {
        Self { storage, bus }
    }

    /// Persist one crash report. The URL, when present, is stored as a
    /// fingerprint only. Storage errors are logged, not propagated — a
    /// failing report must not take the host down with the tab.
    pub async fn record(&self, url: Option<&str>, reason: &str) {
        let fingerprint = url.map(url_fingerprint);
        match self
            .storage
            .insert_crash_report(fingerprint.as_deref(), reason)
            .await
        {
            Ok(report) => {
                self.bus.publish(
                    "crash.recorded",
                    serde_json::json!({ "id": report.id, "reason": report.reason }),
                );
            }
            Err(e) => warn!(err = %e, "failed to persist crash report"),
        }
    }
}

// ─── Known issues ─────────────────────────────────────────────────────────────

/// One upstream defect worth knowing about when triaging a crash.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KnownIssue {
    pub id: String,
    pub component: String,
    pub summary: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct KnownIssueFile {
    #[serde(default)]
    issue: Vec<KnownIssue>,
}

/// Issues shipped with the host — defects in the toolkit layers beneath
/// it that show up as host-level symptoms.
pub fn builtin_issues() -> Vec<KnownIssue> {
    vec![
        KnownIssue {
            id: "inspector-blank-panel".into(),
            component: "devtools".into(),
            summary: "The page inspector can open to a blank panel; reopening it usually helps."
                .into(),
            reference: None,
        },
        KnownIssue {
            id: "webview-random-crash".into(),
            component: "webview".into(),
            summary: "Sporadic renderer crashes with no reproducible trigger; crash isolation \
                      keeps them to one tab."
                .into(),
            reference: None,
        },
    ]
}

/// Load `{data_dir}/known_issues.toml`. A missing file is fine; a
/// malformed one warns and is ignored.
pub fn load_known_issues(data_dir: &Path) -> Vec<KnownIssue> {
    let path = data_dir.join("known_issues.toml");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    match toml::from_str::<KnownIssueFile>(&contents) {
        Ok(file) => file.issue,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "known_issues.toml parse error — ignoring");
            Vec::new()
        }
    }
}

/// Upsert built-in and file-provided issues into storage. File entries
/// win over built-ins with the same id.
pub async fn sync_known_issues(storage: &Storage, data_dir: &Path) -> Result<usize> {
    let mut issues = builtin_issues();
    for issue in load_known_issues(data_dir) {
        issues.retain(|i| i.id != issue.id);
        issues.push(issue);
    }
    let count = issues.len();
    for issue in &issues {
        storage.upsert_known_issue(issue).await?;
    }
    Ok(count)
}
